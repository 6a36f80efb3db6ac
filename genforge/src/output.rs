//! Timestamped output files.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use genforge_ml::{Media, video::export_to_video};

/// `<dir>/<YYYYMMDD_HHMMSS_micros>_<suffix>`, creating `dir` if needed.
///
/// An existing file is never reused; the timestamp is re-sampled until the
/// name is free.
pub fn timestamped_path(dir: &Path, suffix: &str) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    loop {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
        let path = dir.join(format!("{timestamp}_{suffix}"));
        if !path.exists() {
            return Ok(path);
        }
        std::thread::yield_now();
    }
}

/// Persist the first image, or the whole video at `fps`.
pub fn save_media(media: &Media, dir: &Path, suffix: &str, fps: u32) -> anyhow::Result<PathBuf> {
    let path = timestamped_path(dir, suffix)?;
    match media {
        Media::Images(images) => {
            let image = images.first().context("pipeline returned no images")?;
            image
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Media::Video(frames) => export_to_video(frames, &path, fps)?,
    }
    tracing::info!("saved {}", path.display());
    Ok(path)
}

/// Matches `<YYYYMMDD>_<HHMMSS>_<micros>_<suffix>`.
pub fn is_output_name(name: &str, suffix: &str) -> bool {
    let Some(stamp) = name
        .strip_suffix(suffix)
        .and_then(|stem| stem.strip_suffix('_'))
    else {
        return false;
    };
    let parts: Vec<&str> = stamp.split('_').collect();
    matches!(parts.as_slice(), [date, time, micros]
        if date.len() == 8 && time.len() == 6 && micros.len() == 6
            && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit())))
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;

    #[test]
    fn names_follow_the_timestamp_pattern() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = timestamped_path(&dir.path().join("t2i/Flex.1_alpha"), "flex1_alpha.png")?;

        assert!(path.parent().is_some_and(Path::is_dir));
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(is_output_name(name, "flex1_alpha.png"), "{name}");
        Ok(())
    }

    #[test]
    fn consecutive_saves_never_collide() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let media = Media::Images(vec![RgbImage::new(4, 4)]);

        let first = save_media(&media, dir.path(), "flex1_alpha.png", 0)?;
        let second = save_media(&media, dir.path(), "flex1_alpha.png", 0)?;
        assert_ne!(first, second);
        assert!(first.is_file() && second.is_file());
        Ok(())
    }

    #[test]
    fn pattern_rejects_foreign_names() {
        assert!(is_output_name("20250101_120000_000001_flex1_alpha.png", "flex1_alpha.png"));
        assert!(!is_output_name("20250101_120000_flex1_alpha.png", "flex1_alpha.png"));
        assert!(!is_output_name("20250101_120000_00000x_flex1_alpha.png", "flex1_alpha.png"));
        assert!(!is_output_name("20250101_120000_000001_other.png", "flex1_alpha.png"));
    }

    #[test]
    fn empty_image_batches_are_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(save_media(&Media::Images(Vec::new()), dir.path(), "x.png", 0).is_err());
        Ok(())
    }
}
