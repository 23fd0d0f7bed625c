//! Local video files decoded with FFmpeg.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::{SourceInfo, VideoSource, VideoSourceHandle};
use crate::frame::Frame;

const AV_TIME_BASE: f64 = 1_000_000.0;

pub(crate) struct FfmpegFileSource {
    path: PathBuf,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    fps: f64,
    total_frames: u64,
    position: u64,
    eof_sent: bool,
}

// The FFmpeg contexts are only touched from the thread that owns the source.
unsafe impl Send for FfmpegFileSource {}

impl FfmpegFileSource {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open '{}' with ffmpeg", path.display()))?;
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", path.display()))?;
        let stream_index = stream.index();

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            0.0
        };
        let mut total_frames = stream.frames().max(0) as u64;
        if total_frames == 0 && fps > 0.0 && input.duration() > 0 {
            total_frames = (input.duration() as f64 / AV_TIME_BASE * fps).floor() as u64;
        }

        let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "file {} opened (ffmpeg, {} frames at {:.2} fps)",
            path.display(),
            total_frames,
            fps
        );
        Ok(Self {
            path: path.to_path_buf(),
            input,
            stream_index,
            decoder,
            scaler,
            fps,
            total_frames,
            position: 0,
            eof_sent: false,
        })
    }

    fn emit(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut rgb = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb)?;
        let frame = Frame::from_rgb(pixels, width, height, self.position)?;
        self.position += 1;
        Ok(frame)
    }
}

impl VideoSource for FfmpegFileSource {
    fn describe(&self) -> SourceInfo {
        SourceInfo {
            handle: VideoSourceHandle::File(self.path.clone()),
            seekable: self.total_frames > 0 && self.fps > 0.0,
            total_frames: self.total_frames,
        }
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.emit(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut fed = false;
            for (stream, packet) in self.input.packets() {
                if stream.index() != self.stream_index {
                    continue;
                }
                self.decoder
                    .send_packet(&packet)
                    .context("send packet to ffmpeg decoder")?;
                fed = true;
                break;
            }
            if !fed {
                self.decoder.send_eof().context("flush ffmpeg decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, index: u64) -> Result<()> {
        if self.fps <= 0.0 {
            return Err(anyhow!("{} has no frame rate; cannot seek", self.path.display()));
        }
        let target = (index as f64 / self.fps * AV_TIME_BASE) as i64;
        self.input
            .seek(target, ..target)
            .with_context(|| format!("seek {} to frame {}", self.path.display(), index))?;
        self.decoder.flush();
        self.eof_sent = false;
        self.position = index;
        Ok(())
    }

    fn frame_count(&self) -> u64 {
        self.total_frames
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
