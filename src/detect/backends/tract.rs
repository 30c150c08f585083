#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::labels::label_for;
use crate::detect::result::{non_max_suppression, BoundingBox, Detection};

/// Tract-based backend for YOLOv8 ONNX exports.
///
/// Loads a local model file, resizes each image to the square model input and
/// maps the boxes back to the pixel space of the original image.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>,
    input_size: u32,
    class_names: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            class_names,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the default confidence and NMS thresholds.
    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(anyhow!("image has no pixels"));
        }
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into_tvalue()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a rank-3 YOLO output tensor")?;

        let params = DecodeParams {
            input_size: self.input_size,
            width,
            height,
            confidence_threshold: self.confidence_threshold,
        };
        let candidates = decode_yolov8(view, &params, &self.class_names)?;
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank).map(|_| ())
    }
}

struct DecodeParams {
    input_size: u32,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

/// Decode a YOLOv8 head: `[1, 4 + classes, anchors]`, or the transposed
/// `[1, anchors, 4 + classes]` some exporters emit. Boxes are center/size in
/// model input pixels.
fn decode_yolov8(
    output: tract_ndarray::ArrayView3<f32>,
    params: &DecodeParams,
    class_names: &[String],
) -> Result<Vec<Detection>> {
    let shape = output.shape();
    let (channels, anchors) = (shape[1], shape[2]);
    let transposed = channels > anchors;
    let (channels, anchors) = if transposed {
        (anchors, channels)
    } else {
        (channels, anchors)
    };
    if channels < 5 {
        return Err(anyhow!("unexpected YOLO output shape {:?}", shape));
    }
    let at = |c: usize, i: usize| {
        if transposed {
            output[[0, i, c]]
        } else {
            output[[0, c, i]]
        }
    };

    let sx = params.width as f32 / params.input_size as f32;
    let sy = params.height as f32 / params.input_size as f32;
    let mut detections = Vec::new();
    for i in 0..anchors {
        let (class_id, score) = (4..channels)
            .map(|c| (c - 4, at(c, i)))
            .fold((0, f32::NEG_INFINITY), |best, cur| {
                if cur.1 > best.1 {
                    cur
                } else {
                    best
                }
            });
        if !score.is_finite() || score < params.confidence_threshold {
            continue;
        }
        let bbox = BoundingBox::from_center(at(0, i), at(1, i), at(2, i), at(3, i))
            .scale(sx, sy)
            .clamp_to(params.width, params.height);
        if !bbox.is_valid() {
            continue;
        }
        detections.push(Detection::new(
            bbox,
            score.clamp(0.0, 1.0),
            class_id,
            label_for(class_names, class_id),
        ));
    }
    Ok(detections)
}
