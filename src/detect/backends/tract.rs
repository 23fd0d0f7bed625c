#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::{non_max_suppression, BoundingBox, DetectionResult};
use crate::frame::Frame;
use crate::Category;

type YoloPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Grey value used to pad the letterboxed input.
const PAD_VALUE: f32 = 144.0 / 255.0;

/// Output tensor layout of the exported YOLO head.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputLayout {
    /// `[1, N, 5 + nc]`: box, objectness, class scores per row.
    V5,
    /// `[1, 4 + nc, N]`: box and class scores per column, no objectness.
    V8,
}

/// Construction parameters for a YOLO detector.
#[derive(Clone, Debug)]
pub struct YoloConfig {
    pub layout: OutputLayout,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Candidates below this score are discarded before NMS.
    pub confidence: f32,
    pub iou: f32,
    pub class_names: Vec<String>,
}

/// Tract-based YOLO detector.
///
/// Loads a local ONNX export and runs it on the CPU. No network I/O; the only disk
/// access is the model load.
pub struct YoloDetector {
    category: Category,
    model: YoloPlan,
    config: YoloConfig,
}

impl YoloDetector {
    pub fn new<P: AsRef<Path>>(category: Category, model_path: P, config: YoloConfig) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = config.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            category,
            model,
            config,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<(Tensor, f32)> {
        let size = self.config.input_size;
        let (w0, h0) = (frame.width() as f32, frame.height() as f32);
        if w0 < 1.0 || h0 < 1.0 {
            return Err(anyhow!("empty frame"));
        }
        let ratio = (size as f32 / w0).min(size as f32 / h0);
        let new_w = ((w0 * ratio).round() as u32).clamp(1, size);
        let new_h = ((h0 * ratio).round() as u32).clamp(1, size);
        let resized = imageops::resize(frame.image(), new_w, new_h, FilterType::Triangle);

        let size = size as usize;
        let mut input = tract_ndarray::Array4::<f32>::from_elem((1, 3, size, size), PAD_VALUE);
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for channel in 0..3 {
                input[[0, channel, y, x]] = pixel.0[channel] as f32 / 255.0;
            }
        }

        Ok((input.into_tensor(), ratio))
    }

    fn label_for(&self, class_id: usize) -> String {
        self.config
            .class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class {}", class_id))
    }

    fn decode(&self, outputs: TVec<TValue>, ratio: f32, frame: &Frame) -> Result<Vec<DetectionResult>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
        }

        let mut candidates = Vec::new();
        match self.config.layout {
            OutputLayout::V8 => {
                let (rows, anchors) = (shape[1], shape[2]);
                if rows <= 4 {
                    return Err(anyhow!("YOLOv8 output has no class rows: {:?}", shape));
                }
                for j in 0..anchors {
                    let (class_id, score) = (4..rows)
                        .map(|r| (r - 4, preds[[0, r, j]]))
                        .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
                    if score < self.config.confidence {
                        continue;
                    }
                    let bbox = BoundingBox::from_center(
                        preds[[0, 0, j]] / ratio,
                        preds[[0, 1, j]] / ratio,
                        preds[[0, 2, j]] / ratio,
                        preds[[0, 3, j]] / ratio,
                    );
                    candidates.push(DetectionResult::new(self.category, self.label_for(class_id), score, bbox));
                }
            }
            OutputLayout::V5 => {
                let (anchors, cols) = (shape[1], shape[2]);
                if cols <= 5 {
                    return Err(anyhow!("YOLOv5 output has no class columns: {:?}", shape));
                }
                for i in 0..anchors {
                    let objectness = preds[[0, i, 4]];
                    if objectness < self.config.confidence {
                        continue;
                    }
                    let (class_id, class_score) = (5..cols)
                        .map(|c| (c - 5, preds[[0, i, c]]))
                        .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
                    let score = objectness * class_score;
                    if score < self.config.confidence {
                        continue;
                    }
                    let bbox = BoundingBox::from_center(
                        preds[[0, i, 0]] / ratio,
                        preds[[0, i, 1]] / ratio,
                        preds[[0, i, 2]] / ratio,
                        preds[[0, i, 3]] / ratio,
                    );
                    candidates.push(DetectionResult::new(self.category, self.label_for(class_id), score, bbox));
                }
            }
        }

        non_max_suppression(&mut candidates, self.config.iou);
        Ok(candidates
            .into_iter()
            .filter_map(|mut det| {
                det.bbox = det.bbox.clamped(frame.width(), frame.height())?;
                Some(det)
            })
            .collect())
    }
}

impl Detector for YoloDetector {
    fn name(&self) -> &'static str {
        match self.config.layout {
            OutputLayout::V5 => "tract-yolov5",
            OutputLayout::V8 => "tract-yolov8",
        }
    }

    fn category(&self) -> Category {
        self.category
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectionResult>> {
        let (input, ratio) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, ratio, frame)
    }
}
