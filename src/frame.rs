//! Frames and overlay drawing.
//!
//! - `Frame`: an owned RGB image tagged with its position in the source.
//! - `Annotator`: draws detection boxes and labels onto a frame.
//!
//! Every processing cycle works on its own copies of a frame. The display copy and the
//! email copy are separate allocations, so a consumer never observes a half-drawn image
//! and the two variants never alias.

use std::path::Path;
use std::time::{Duration, Instant};

use ab_glyph::{FontArc, PxScale};
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;

use crate::detect::BoundingBox;

/// Line thickness of annotation boxes, in pixels.
const BOX_THICKNESS: i32 = 2;
/// Label glyph height, in pixels.
const LABEL_SCALE: f32 = 22.0;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    /// Zero-based index of this frame within its source.
    index: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, index: u64) -> Self {
        Self {
            image,
            index,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from packed RGB24 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, index))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Write the frame as an image file; the format follows the extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.image
            .save(path)
            .with_context(|| format!("failed to write snapshot {}", path.display()))
    }
}

// ----------------------------------------------------------------------------
// Annotator
// ----------------------------------------------------------------------------

/// Draws boxes and (when a font is configured) text labels.
#[derive(Clone, Default)]
pub struct Annotator {
    font: Option<FontArc>,
}

impl Annotator {
    /// Boxes only, no label text.
    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    pub fn with_font_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = FontArc::try_from_vec(bytes)
            .map_err(|_| anyhow!("invalid font file {}", path.display()))?;
        Ok(Self { font: Some(font) })
    }

    /// Load the configured font, falling back to box-only drawing.
    pub fn from_config(font_path: Option<&Path>) -> Self {
        match font_path {
            Some(path) => match Self::with_font_file(path) {
                Ok(annotator) => annotator,
                Err(err) => {
                    log::warn!("labels disabled: {:#}", err);
                    Self::boxes_only()
                }
            },
            None => Self::boxes_only(),
        }
    }

    pub fn draws_text(&self) -> bool {
        self.font.is_some()
    }

    /// Draw one labelled box. Coordinates are clamped to the frame.
    pub fn draw(&self, frame: &mut Frame, bbox: &BoundingBox, label: &str, color: Rgb<u8>) {
        let (width, height) = (frame.width(), frame.height());
        let Some(clamped) = bbox.clamped(width, height) else {
            return;
        };
        let x1 = clamped.x1.round() as i32;
        let y1 = clamped.y1.round() as i32;
        let x2 = clamped.x2.round() as i32;
        let y2 = clamped.y2.round() as i32;

        let image = frame.image_mut();
        for inset in 0..BOX_THICKNESS {
            let w = x2 - x1 - 2 * inset;
            let h = y2 - y1 - 2 * inset;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32);
            draw_hollow_rect_mut(image, rect, color);
        }

        if let Some(font) = &self.font {
            let text_y = (y1 - LABEL_SCALE as i32 - 4).max(0);
            draw_text_mut(
                image,
                color,
                x1,
                text_y,
                PxScale::from(LABEL_SCALE),
                font,
                label,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rgb_validates_length() {
        assert!(Frame::from_rgb(vec![0u8; 12], 2, 2, 0).is_ok());
        assert!(Frame::from_rgb(vec![0u8; 11], 2, 2, 0).is_err());
    }

    #[test]
    fn draw_outlines_box_and_leaves_copy_untouched() {
        let frame = Frame::new(RgbImage::new(32, 32), 7);
        let mut display = frame.clone();
        let red = Rgb([255, 0, 0]);
        Annotator::boxes_only().draw(
            &mut display,
            &BoundingBox::new(4.0, 4.0, 20.0, 20.0),
            "Fire",
            red,
        );

        assert_eq!(*display.image().get_pixel(4, 4), red);
        assert_eq!(*display.image().get_pixel(5, 10), red);
        assert_eq!(*display.image().get_pixel(12, 12), Rgb([0, 0, 0]));
        assert_eq!(*frame.image().get_pixel(4, 4), Rgb([0, 0, 0]));
        assert_eq!(display.index(), 7);
    }

    #[test]
    fn draw_ignores_boxes_outside_the_frame() {
        let mut frame = Frame::new(RgbImage::new(16, 16), 0);
        Annotator::boxes_only().draw(
            &mut frame,
            &BoundingBox::new(40.0, 40.0, 60.0, 60.0),
            "x",
            Rgb([0, 255, 0]),
        );
        assert!(frame.image().pixels().all(|p| *p == Rgb([0, 0, 0])));
    }
}
