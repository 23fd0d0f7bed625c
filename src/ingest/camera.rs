use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::RgbImage;

use super::{SourceInfo, SourceOptions, VideoSource, VideoSourceHandle};
use crate::frame::Frame;

/// Camera indices currently held open. A device can only be opened once at a time.
static CLAIMED: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());

/// Exclusive hold on a camera index, shared between the source and the capture loop.
///
/// The index is freed by the first `release`, or when the last clone is dropped. Once
/// released, the source's pacing wait wakes and further reads fail.
#[derive(Clone)]
pub struct DeviceClaim(Arc<ClaimInner>);

struct ClaimInner {
    index: u32,
    released: Mutex<bool>,
    wake: Condvar,
}

impl DeviceClaim {
    fn acquire(index: u32) -> Result<Self> {
        let mut claimed = CLAIMED.lock().unwrap_or_else(|p| p.into_inner());
        if !claimed.insert(index) {
            return Err(anyhow!("camera {} is busy", index));
        }
        Ok(Self(Arc::new(ClaimInner {
            index,
            released: Mutex::new(false),
            wake: Condvar::new(),
        })))
    }

    pub fn index(&self) -> u32 {
        self.0.index
    }

    pub fn release(&self) {
        self.0.release();
    }

    pub fn is_released(&self) -> bool {
        *self.0.released.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep for `timeout` or until released. Returns false if the claim was released.
    fn wait(&self, timeout: Duration) -> bool {
        let released = self.0.released.lock().unwrap_or_else(|p| p.into_inner());
        let (released, _) = self
            .0
            .wake
            .wait_timeout_while(released, timeout, |released| !*released)
            .unwrap_or_else(|p| p.into_inner());
        !*released
    }
}

impl ClaimInner {
    fn release(&self) {
        let mut released = self.released.lock().unwrap_or_else(|p| p.into_inner());
        if *released {
            return;
        }
        *released = true;
        CLAIMED
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.index);
        self.wake.notify_all();
    }
}

impl Drop for ClaimInner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Generated live camera, paced to the configured frame rate.
pub struct SyntheticCamera {
    index: u32,
    width: u32,
    height: u32,
    interval: Option<Duration>,
    next_due: Option<Instant>,
    frames: u64,
    claim: DeviceClaim,
}

impl SyntheticCamera {
    pub fn open(index: u32, options: &SourceOptions) -> Result<Self> {
        if index >= options.synthetic_cameras {
            return Err(anyhow!("no camera at index {}", index));
        }
        let claim = DeviceClaim::acquire(index)?;
        log::info!(
            "camera {} opened (synthetic {}x{})",
            index,
            options.width,
            options.height
        );
        Ok(Self {
            index,
            width: options.width,
            height: options.height,
            interval: (options.fps > 0)
                .then(|| Duration::from_secs_f64(1.0 / options.fps as f64)),
            next_due: None,
            frames: 0,
            claim,
        })
    }

    fn pace(&mut self) -> Result<()> {
        let Some(interval) = self.interval else {
            return Ok(());
        };
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now && !self.claim.wait(due - now) {
                return Err(anyhow!("camera {} was released", self.index));
            }
        }
        self.next_due = Some(Instant::now() + interval);
        Ok(())
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.claim.release();
    }
}

impl VideoSource for SyntheticCamera {
    fn describe(&self) -> SourceInfo {
        SourceInfo {
            handle: VideoSourceHandle::Camera(self.index),
            seekable: false,
            total_frames: 0,
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.claim.is_released() {
            return Err(anyhow!("camera {} was released", self.index));
        }
        self.pace()?;
        let image = scene(self.width, self.height, self.frames);
        let frame = Frame::new(image, self.frames);
        self.frames += 1;
        Ok(Some(frame))
    }

    fn position(&self) -> u64 {
        self.frames
    }

    fn set_position(&mut self, _index: u64) -> Result<()> {
        Err(anyhow!("camera {} is a live source and cannot seek", self.index))
    }

    fn frame_count(&self) -> u64 {
        0
    }

    fn claim(&self) -> Option<DeviceClaim> {
        Some(self.claim.clone())
    }
}

/// Slowly drifting gradient; deterministic per frame number.
pub(crate) fn scene(width: u32, height: u32, frame: u64) -> RgbImage {
    let shift = (frame % 256) as u32;
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            ((x + shift) % 256) as u8,
            ((y + shift / 2) % 256) as u8,
            (((x + y) / 2 + frame as u32 / 50) % 256) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SourceOptions {
        SourceOptions {
            synthetic_cameras: 16,
            width: 8,
            height: 6,
            fps: 0,
            ..SourceOptions::default()
        }
    }

    #[test]
    fn camera_is_exclusive_until_dropped() {
        let first = SyntheticCamera::open(11, &options()).unwrap();
        assert!(SyntheticCamera::open(11, &options()).is_err());
        drop(first);
        assert!(SyntheticCamera::open(11, &options()).is_ok());
    }

    #[test]
    fn camera_is_live_and_not_seekable() {
        let mut camera = SyntheticCamera::open(12, &options()).unwrap();
        let info = camera.describe();
        assert!(!info.seekable);
        assert_eq!(info.total_frames, 0);
        let frame = camera.read().unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (8, 6));
        assert_eq!(camera.position(), 1);
        assert!(camera.set_position(0).is_err());
    }

    #[test]
    fn released_claim_frees_index_and_wakes_pacing() {
        let paced = SourceOptions {
            fps: 1,
            ..options()
        };
        let mut camera = SyntheticCamera::open(13, &paced).unwrap();
        camera.read().unwrap();
        let claim = camera.claim().unwrap();

        let reader = std::thread::spawn(move || {
            let started = Instant::now();
            let result = camera.read();
            (result.is_err(), started.elapsed())
        });
        std::thread::sleep(Duration::from_millis(50));
        claim.release();
        assert!(SyntheticCamera::open(13, &options()).is_ok());

        let (failed, waited) = reader.join().unwrap();
        assert!(failed);
        assert!(waited < Duration::from_millis(900));
    }

    #[test]
    fn unknown_index_fails_to_open() {
        assert!(SyntheticCamera::open(99, &options()).is_err());
    }
}
