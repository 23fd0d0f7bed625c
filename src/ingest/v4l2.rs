//! Linux V4L2 cameras (`/dev/video{index}`).

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{to_rgb, PixelFormat};
use super::{SourceInfo, SourceOptions, VideoSource, VideoSourceHandle};
use crate::frame::Frame;

#[self_referencing]
struct CameraStream {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct V4l2Camera {
    index: u32,
    state: CameraStream,
    format: PixelFormat,
    width: u32,
    height: u32,
    frames: u64,
}

// The mmap stream is only touched from the thread that owns the camera.
unsafe impl Send for V4l2Camera {}

impl V4l2Camera {
    pub fn open(index: u32, options: &SourceOptions) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let path = format!("/dev/video{}", index);
        let mut device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = options.width;
        format.height = options.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("camera {}: failed to set format: {}", index, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "camera {} delivers unsupported pixel format {}",
                index,
                format.fourcc
            )
        })?;

        if options.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(options.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("camera {}: failed to set fps: {}", index, err);
            }
        }

        let state = CameraStreamBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "camera {} opened ({}x{} {:?})",
            index,
            format.width,
            format.height,
            pixel_format
        );
        Ok(Self {
            index,
            state,
            format: pixel_format,
            width: format.width,
            height: format.height,
            frames: 0,
        })
    }
}

impl VideoSource for V4l2Camera {
    fn describe(&self) -> SourceInfo {
        SourceInfo {
            handle: VideoSourceHandle::Camera(self.index),
            seekable: false,
            total_frames: 0,
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        let pixels = self.state.with_mut(|fields| -> Result<Vec<u8>> {
            let (buf, _meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            to_rgb(buf, width, height, format)
        })?;
        let frame = Frame::from_rgb(pixels, width, height, self.frames)?;
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
}
