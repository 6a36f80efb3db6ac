#[tokio::main]
async fn main() -> anyhow::Result<()> {
    genforge::app::run().await
}
