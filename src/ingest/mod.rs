//! Video sources.
//!
//! A source is opened from a `VideoSourceHandle`:
//! - `Camera(index)`: synthetic cameras, or `/dev/video{index}` (feature: ingest-v4l2)
//! - `File(path)`: `stub://` synthetic clips, directories of still images, or video files
//!   (feature: ingest-file-ffmpeg)
//!
//! Cameras are live and never seekable. File sources with a known frame count are
//! seekable and report playback progress.
//!
//! Sources are owned by the capture worker. Dropping a source releases the device; a
//! source that exposes a `DeviceClaim` can also be released while a read is in flight.

mod camera;
mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
mod file_ffmpeg;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
#[cfg(feature = "ingest-v4l2")]
mod v4l2;

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;

pub use camera::{DeviceClaim, SyntheticCamera};
pub use file::{ImageSequenceSource, SyntheticClip};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Camera;

use crate::config::{CameraBackend, CaptureSettings};
use crate::frame::Frame;

/// Identifies a camera by device index or a recorded file by path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VideoSourceHandle {
    Camera(u32),
    File(PathBuf),
}

impl VideoSourceHandle {
    /// Operator-facing name: `Webcam {index}` or the file name.
    pub fn label(&self) -> String {
        match self {
            VideoSourceHandle::Camera(index) => format!("Webcam {}", index),
            VideoSourceHandle::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }

    pub fn is_camera(&self) -> bool {
        matches!(self, VideoSourceHandle::Camera(_))
    }
}

impl fmt::Display for VideoSourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoSourceHandle::Camera(index) => write!(f, "camera {}", index),
            VideoSourceHandle::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Derived properties of an opened source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub handle: VideoSourceHandle,
    /// True only for file sources with a known frame count.
    pub seekable: bool,
    /// Zero when unknown or not applicable.
    pub total_frames: u64,
}

impl SourceInfo {
    pub fn label(&self) -> String {
        self.handle.label()
    }
}

pub trait VideoSource: Send {
    fn describe(&self) -> SourceInfo;

    /// Next frame, or `None` at end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Index of the frame the next `read` returns.
    fn position(&self) -> u64;

    fn set_position(&mut self, index: u64) -> Result<()>;

    /// Total frames, zero when unknown.
    fn frame_count(&self) -> u64;

    /// Hold on the underlying device that can be released from another thread.
    fn claim(&self) -> Option<DeviceClaim> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct SourceOptions {
    pub camera_backend: CameraBackend,
    /// Number of synthetic camera indices (`0..n`) that open successfully.
    pub synthetic_cameras: u32,
    /// Frame size generated by synthetic sources and requested from cameras.
    pub width: u32,
    pub height: u32,
    /// Camera frame rate; zero leaves synthetic cameras unpaced.
    pub fps: u32,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            camera_backend: CameraBackend::Synthetic,
            synthetic_cameras: 1,
            width: 640,
            height: 480,
            fps: 15,
        }
    }
}

impl SourceOptions {
    pub fn from_settings(settings: &CaptureSettings) -> Self {
        Self {
            camera_backend: settings.camera_backend,
            width: settings.synthetic_width,
            height: settings.synthetic_height,
            fps: settings.synthetic_fps,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SourceFactory {
    options: SourceOptions,
}

impl SourceFactory {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SourceOptions {
        &self.options
    }

    pub fn open(&self, handle: &VideoSourceHandle) -> Result<Box<dyn VideoSource>> {
        match handle {
            VideoSourceHandle::Camera(index) => self.open_camera(*index),
            VideoSourceHandle::File(path) => file::open(path, &self.options),
        }
    }

    fn open_camera(&self, index: u32) -> Result<Box<dyn VideoSource>> {
        match self.options.camera_backend {
            CameraBackend::Synthetic => Ok(Box::new(SyntheticCamera::open(index, &self.options)?)),
            CameraBackend::V4l2 => {
                #[cfg(feature = "ingest-v4l2")]
                {
                    Ok(Box::new(V4l2Camera::open(index, &self.options)?))
                }
                #[cfg(not(feature = "ingest-v4l2"))]
                {
                    Err(anyhow::anyhow!(
                        "camera {} requires the ingest-v4l2 feature",
                        index
                    ))
                }
            }
        }
    }

    /// Camera indices below `max` that open successfully. Each probe is closed again.
    pub fn probe_cameras(&self, max: u32) -> Vec<u32> {
        (0..max)
            .filter(|index| match self.open_camera(*index) {
                Ok(_) => true,
                Err(err) => {
                    log::debug!("camera {} unavailable: {:#}", index, err);
                    false
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_match_operator_names() {
        assert_eq!(VideoSourceHandle::Camera(2).label(), "Webcam 2");
        assert_eq!(
            VideoSourceHandle::File(PathBuf::from("/srv/clips/lobby.mp4")).label(),
            "lobby.mp4"
        );
    }

    #[test]
    fn probe_lists_synthetic_cameras() {
        let factory = SourceFactory::new(SourceOptions {
            synthetic_cameras: 2,
            ..SourceOptions::default()
        });
        assert_eq!(factory.probe_cameras(5), vec![0, 1]);
    }
}
