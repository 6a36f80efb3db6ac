//! Video decode/encode through the `ffmpeg` command-line tool.

use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result, bail};
use image::RgbImage;

fn ffmpeg() -> Command {
    Command::new(std::env::var_os("FFMPEG").unwrap_or_else(|| "ffmpeg".into()))
}

/// Decode every frame of `path`, scaled to `width`x`height`.
#[tracing::instrument(level = "info", skip_all, fields(path = %path.display()))]
pub fn load_frames(path: &Path, width: u32, height: u32) -> Result<Vec<RgbImage>> {
    let output = ffmpeg()
        .args(["-v", "error", "-i"])
        .arg(path)
        .args(["-vf", &format!("scale={width}:{height}")])
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
        .stdin(Stdio::null())
        .output()
        .context("failed to spawn ffmpeg")?;

    if !output.status.success() {
        bail!(
            "ffmpeg could not decode {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    split_frames(output.stdout, width, height)
}

pub(crate) fn split_frames(raw: Vec<u8>, width: u32, height: u32) -> Result<Vec<RgbImage>> {
    let frame_len = width as usize * height as usize * 3;
    anyhow::ensure!(frame_len > 0, "frame size must be non-zero");
    anyhow::ensure!(!raw.is_empty(), "video contains no frames");
    anyhow::ensure!(
        raw.len() % frame_len == 0,
        "decoded {} bytes, not a whole number of {width}x{height} frames",
        raw.len()
    );

    raw.chunks_exact(frame_len)
        .map(|chunk| {
            RgbImage::from_raw(width, height, chunk.to_vec())
                .ok_or_else(|| anyhow::anyhow!("failed to build frame buffer"))
        })
        .collect()
}

fn encode_args(width: u32, height: u32, fps: u32, path: &Path) -> Vec<String> {
    [
        "-y", "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgb24", "-s",
    ]
    .into_iter()
    .map(str::to_string)
    .chain([
        format!("{width}x{height}"),
        "-r".to_string(),
        fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        path.to_string_lossy().into_owned(),
    ])
    .collect()
}

/// Encode `frames` as an H.264 MP4 at `fps`.
#[tracing::instrument(level = "info", skip(frames), fields(frames = frames.len()))]
pub fn export_to_video(frames: &[RgbImage], path: &Path, fps: u32) -> Result<()> {
    let Some(first) = frames.first() else {
        bail!("no frames to encode");
    };
    let (width, height) = first.dimensions();
    anyhow::ensure!(fps > 0, "fps must be positive");
    anyhow::ensure!(
        frames.iter().all(|frame| frame.dimensions() == (width, height)),
        "all frames must share the same size"
    );

    let mut encoder = ffmpeg();
    encoder.args(encode_args(width, height, fps, path));
    encode_with(encoder, frames, path)
}

fn encode_with(mut encoder: Command, frames: &[RgbImage], path: &Path) -> Result<()> {
    let mut child = encoder
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn ffmpeg")?;

    // the child is always reaped, even when it stops reading early
    let written = write_frames(&mut child, frames);
    let output = child
        .wait_with_output()
        .context("failed to wait for ffmpeg")?;
    if !output.status.success() {
        bail!(
            "ffmpeg could not encode {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    written.context("failed to stream frames to ffmpeg")
}

fn write_frames(child: &mut Child, frames: &[RgbImage]) -> Result<()> {
    let mut stdin = child
        .stdin
        .take()
        .context("ffmpeg stdin is not available")?;
    for frame in frames {
        stdin.write_all(frame.as_raw())?;
    }
    Ok(())
}
