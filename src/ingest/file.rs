//! Recorded sources: synthetic `stub://` clips, image-sequence directories, and video
//! files decoded with FFmpeg.
//!
//! File sources only accept local paths. URL schemes other than `stub://` are refused.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use super::camera::scene;
#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::{SourceInfo, SourceOptions, VideoSource, VideoSourceHandle};
use crate::frame::Frame;

const DEFAULT_STUB_FRAMES: u64 = 300;
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

pub(crate) fn open(path: &Path, options: &SourceOptions) -> Result<Box<dyn VideoSource>> {
    let raw = path.to_string_lossy();
    if raw.trim().is_empty() {
        return Err(anyhow!("file source path is empty"));
    }
    if raw.starts_with("stub://") {
        return Ok(Box::new(SyntheticClip::from_uri(path, options)?));
    }
    if raw.contains("://") {
        return Err(anyhow!(
            "file sources only support local paths (got '{}')",
            raw
        ));
    }
    if !path.exists() {
        return Err(anyhow!("file not found: {}", path.display()));
    }
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path)?));
    }

    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(FfmpegFileSource::open(path)?))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(anyhow!(
            "decoding {} requires the ingest-file-ffmpeg feature",
            path.display()
        ))
    }
}

// ----------------------------------------------------------------------------
// Synthetic clip (stub://name?frames=N)
// ----------------------------------------------------------------------------

/// Generated clip of fixed length. Seekable.
pub struct SyntheticClip {
    path: PathBuf,
    width: u32,
    height: u32,
    total: u64,
    position: u64,
}

impl SyntheticClip {
    pub fn from_uri(path: &Path, options: &SourceOptions) -> Result<Self> {
        let raw = path.to_string_lossy();
        let rest = raw.trim_start_matches("stub://");
        let total = match rest.split_once('?') {
            Some((_, query)) => parse_frames(query)?,
            None => DEFAULT_STUB_FRAMES,
        };
        log::info!("file {} opened (synthetic, {} frames)", raw, total);
        Ok(Self {
            path: path.to_path_buf(),
            width: options.width,
            height: options.height,
            total,
            position: 0,
        })
    }
}

fn parse_frames(query: &str) -> Result<u64> {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("frames=") {
            return value
                .parse()
                .map_err(|_| anyhow!("invalid frame count '{}' in stub URI", value));
        }
    }
    Ok(DEFAULT_STUB_FRAMES)
}

impl VideoSource for SyntheticClip {
    fn describe(&self) -> SourceInfo {
        SourceInfo {
            handle: VideoSourceHandle::File(self.path.clone()),
            seekable: self.total > 0,
            total_frames: self.total,
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.position >= self.total {
            return Ok(None);
        }
        let frame = Frame::new(
            scene(self.width, self.height, self.position),
            self.position,
        );
        self.position += 1;
        Ok(Some(frame))
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, index: u64) -> Result<()> {
        self.position = index.min(self.total);
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.total
    }
}

// ----------------------------------------------------------------------------
// Image sequence (directory of stills, sorted by name)
// ----------------------------------------------------------------------------

pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    position: u64,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
        {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_image && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(anyhow!("no images found in {}", dir.display()));
        }
        files.sort();
        log::info!("file {} opened ({} images)", dir.display(), files.len());
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            position: 0,
        })
    }
}

impl VideoSource for ImageSequenceSource {
    fn describe(&self) -> SourceInfo {
        SourceInfo {
            handle: VideoSourceHandle::File(self.dir.clone()),
            seekable: true,
            total_frames: self.files.len() as u64,
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.position as usize) else {
            return Ok(None);
        };
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        let frame = Frame::new(image, self.position);
        self.position += 1;
        Ok(Some(frame))
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, index: u64) -> Result<()> {
        self.position = index.min(self.files.len() as u64);
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.files.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn small() -> SourceOptions {
        SourceOptions {
            width: 4,
            height: 4,
            ..SourceOptions::default()
        }
    }

    #[test]
    fn stub_clip_ends_after_requested_frames() {
        let mut clip = open(Path::new("stub://clip?frames=3"), &small()).unwrap();
        let info = clip.describe();
        assert!(info.seekable);
        assert_eq!(info.total_frames, 3);
        assert_eq!(info.label(), "clip?frames=3");
        for expected in 0..3 {
            assert_eq!(clip.read().unwrap().unwrap().index(), expected);
        }
        assert!(clip.read().unwrap().is_none());
    }

    #[test]
    fn stub_clip_seeks() {
        let mut clip = open(Path::new("stub://clip?frames=10"), &small()).unwrap();
        clip.set_position(7).unwrap();
        assert_eq!(clip.read().unwrap().unwrap().index(), 7);
        assert_eq!(clip.position(), 8);
    }

    #[test]
    fn remote_urls_are_refused() {
        assert!(open(Path::new("rtsp://camera/stream"), &small()).is_err());
        assert!(open(Path::new("/no/such/file.mp4"), &small()).is_err());
    }

    #[test]
    fn image_directory_plays_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10u8), ("notes.txt", 0u8)] {
            let path = dir.path().join(name);
            if name.ends_with(".png") {
                RgbImage::from_pixel(2, 2, image::Rgb([shade, shade, shade]))
                    .save(&path)
                    .unwrap();
            } else {
                std::fs::write(&path, "skip").unwrap();
            }
        }
        let mut source = open(dir.path(), &small()).unwrap();
        assert_eq!(source.frame_count(), 2);
        let first = source.read().unwrap().unwrap();
        assert_eq!(first.image().get_pixel(0, 0).0, [10, 10, 10]);
        let second = source.read().unwrap().unwrap();
        assert_eq!(second.image().get_pixel(0, 0).0, [20, 20, 20]);
        assert!(source.read().unwrap().is_none());
    }
}
