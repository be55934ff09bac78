// 该文件是 Posekit 项目的一部分。
// src/model/movenet.rs - MoveNet 单人姿态模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::time::Instant;

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Tensor,
};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::{
  model::{COCO_KEYPOINTS, COCO_SKELETON, EstimatorError, ModelOptions, OptionError, PoseEstimator},
  output::draw::{Draw, DrawError, LineColoring, PointColoring},
  pose::{BoundingBox, Keypoint, PoseData, PoseMetadata},
};

const MOVENET_MODEL_NAME: &str = "MoveNet";
const MOVENET_LIGHTNING_SIZE: u32 = 192;
const MOVENET_THUNDER_SIZE: u32 = 256;
const MOVENET_INPUT_NAME: &str = "serving_default_input_0";
const MOVENET_OUTPUT_NAME: &str = "StatefulPartitionedCall_0";
const MOVENET_KEYPOINTS: usize = 17;
// 绘制与边框使用的关键点可见度阈值
const MOVENET_VISIBILITY: f64 = 0.5;

#[derive(Error, Debug)]
pub enum MoveNetOptionError {
  #[error(transparent)]
  Option(#[from] OptionError),
  #[error("缺少参数 model_path")]
  MissingModelPath,
  #[error(transparent)]
  Font(#[from] DrawError),
}

/// 基于 ONNX Runtime 的 MoveNet 单人姿态模型
///
/// 模型输入为 `[1, S, S, 3]` 的 f32 RGB 张量（0-255），
/// 输出为 `[1, 1, 17, 3]`，每个关键点依次为 y、x、score。
pub struct MoveNetEstimator {
  model_path: PathBuf,
  input_size: u32,
  input_name: String,
  output_name: String,
  min_detection_confidence: f64,
  model_complexity: u32,
  threads: Option<usize>,
  draw: Draw,
  session: Option<Session>,
}

impl MoveNetEstimator {
  /// 读取参数 `model_path`、`model_complexity`、`input_size`、
  /// `min_detection_confidence`、`input_name`、`output_name`、`threads`、`font`
  pub fn from_options(options: &ModelOptions) -> Result<Self, MoveNetOptionError> {
    let model_path = options
      .get_str("model_path")
      .map(PathBuf::from)
      .ok_or(MoveNetOptionError::MissingModelPath)?;
    let model_complexity = options.get_or("model_complexity", 1u32)?;
    let default_size = if model_complexity >= 2 {
      MOVENET_THUNDER_SIZE
    } else {
      MOVENET_LIGHTNING_SIZE
    };
    let input_size = options.get_or("input_size", default_size)?;
    let min_detection_confidence = options.get_unit("min_detection_confidence", 0.5)?;

    let mut draw = Draw::default()
      .with_confidence_threshold(MOVENET_VISIBILITY)
      .with_line_coloring(LineColoring::Uniform(image::Rgb([0, 255, 0])))
      .with_point_coloring(PointColoring::ByRegion)
      .with_bbox(false);
    if let Some(font) = options.get_str("font") {
      draw = draw.with_font_file(font)?;
    }

    Ok(Self {
      model_path,
      input_size,
      input_name: options
        .get_str("input_name")
        .unwrap_or(MOVENET_INPUT_NAME)
        .to_string(),
      output_name: options
        .get_str("output_name")
        .unwrap_or(MOVENET_OUTPUT_NAME)
        .to_string(),
      min_detection_confidence,
      model_complexity,
      threads: options.get("threads")?,
      draw,
      session: None,
    })
  }

  fn preprocess(&self, frame: &RgbImage) -> Array4<f32> {
    let size = self.input_size;
    let resized = image::imageops::resize(frame, size, size, FilterType::Triangle);
    Array4::from_shape_fn((1, size as usize, size as usize, 3), |(_, y, x, c)| {
      resized.get_pixel(x as u32, y as u32)[c] as f32
    })
  }
}

impl PoseEstimator for MoveNetEstimator {
  fn name(&self) -> &str {
    MOVENET_MODEL_NAME
  }

  fn initialize(&mut self) -> Result<(), EstimatorError> {
    if self.session.is_some() {
      return Err(EstimatorError::AlreadyInitialized);
    }
    info!("加载模型文件: {}", self.model_path.display());
    let load = |e: ort::Error| EstimatorError::LoadFailed(e.to_string());

    let mut builder = Session::builder()
      .map_err(load)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(load)?;
    if let Some(threads) = self.threads {
      builder = builder.with_intra_threads(threads).map_err(load)?;
    }
    let session = builder.commit_from_file(&self.model_path).map_err(|e| {
      error!("模型加载失败: {}", e);
      EstimatorError::LoadFailed(format!("{}: {}", self.model_path.display(), e))
    })?;

    debug!(
      "模型输入尺寸: {}x{}, 复杂度: {}",
      self.input_size, self.input_size, self.model_complexity
    );
    self.session = Some(session);
    info!("模型加载完成");
    Ok(())
  }

  fn detect_pose(&mut self, frame: &RgbImage) -> Result<Option<PoseData>, EstimatorError> {
    let now = Instant::now();
    let input = self.preprocess(frame);
    let session = self.session.as_mut().ok_or(EstimatorError::NotInitialized)?;
    let infer = |e: ort::Error| EstimatorError::Inference(e.to_string());

    let tensor = Tensor::from_array(input).map_err(infer)?;
    let outputs = session
      .run(ort::inputs![self.input_name.as_str() => tensor])
      .map_err(infer)?;
    let output: ndarray::ArrayViewD<f32> = outputs[self.output_name.as_str()]
      .try_extract_array()
      .map_err(infer)?;

    if output.len() < MOVENET_KEYPOINTS * 3 {
      return Err(EstimatorError::Inference(format!(
        "模型输出长度为 {}, 少于 {}",
        output.len(),
        MOVENET_KEYPOINTS * 3
      )));
    }
    let values: Vec<f32> = output.iter().take(MOVENET_KEYPOINTS * 3).copied().collect();

    let (width, height) = frame.dimensions();
    let keypoints: Vec<Keypoint> = values
      .chunks_exact(3)
      .zip(COCO_KEYPOINTS)
      .enumerate()
      .map(|(i, (v, name))| {
        Keypoint::from_normalized(
          i as u32,
          name,
          v[1] as f64,
          v[0] as f64,
          v[2] as f64,
          width,
          height,
        )
      })
      .collect();

    let mean_score =
      keypoints.iter().map(|kp| kp.confidence).sum::<f64>() / keypoints.len() as f64;
    let elapsed = now.elapsed().as_secs_f64();
    if mean_score < self.min_detection_confidence {
      debug!("平均置信度 {:.3} 低于阈值，视为未检测到姿态", mean_score);
      return Ok(None);
    }

    let bbox = BoundingBox::enclosing(&keypoints, MOVENET_VISIBILITY);
    Ok(Some(PoseData {
      keypoints,
      bbox,
      metadata: PoseMetadata::new(MOVENET_MODEL_NAME, elapsed)
        .with("model_complexity", self.model_complexity)
        .with("frame_size", vec![width, height]),
    }))
  }

  fn draw_pose(&self, frame: &RgbImage, pose: &PoseData) -> RgbImage {
    self.draw.draw_pose(frame, pose, self.connections())
  }

  fn keypoint_names(&self) -> &[&'static str] {
    &COCO_KEYPOINTS
  }

  fn connections(&self) -> &[(usize, usize)] {
    &COCO_SKELETON
  }

  fn cleanup(&mut self) {
    if self.session.take().is_some() {
      debug!("释放 ONNX 会话");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn model_path_is_required() {
    assert!(matches!(
      MoveNetEstimator::from_options(&ModelOptions::new()),
      Err(MoveNetOptionError::MissingModelPath)
    ));
  }

  #[test]
  fn complexity_selects_input_size() {
    let options = ModelOptions::new().set("model_path", "/models/movenet.onnx");
    let m = MoveNetEstimator::from_options(&options).unwrap();
    assert_eq!(m.input_size, MOVENET_LIGHTNING_SIZE);

    let m = MoveNetEstimator::from_options(&options.clone().set("model_complexity", 2)).unwrap();
    assert_eq!(m.input_size, MOVENET_THUNDER_SIZE);
  }

  #[test]
  fn missing_model_file_fails_initialize() {
    let options = ModelOptions::new().set("model_path", "/nonexistent/movenet.onnx");
    let mut m = MoveNetEstimator::from_options(&options).unwrap();
    assert!(matches!(m.initialize(), Err(EstimatorError::LoadFailed(_))));
    let frame = RgbImage::new(8, 8);
    assert!(matches!(
      m.detect_pose(&frame),
      Err(EstimatorError::NotInitialized)
    ));
  }
}
