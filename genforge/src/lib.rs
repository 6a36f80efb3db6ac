pub mod app;
pub mod endpoints;
pub mod loader;
pub mod output;
pub mod progress;
pub mod result;
pub mod seed;
pub mod server;
pub mod service;
pub mod settings;
pub mod tabs;
pub mod version;
