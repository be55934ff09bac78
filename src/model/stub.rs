// 该文件是 Posekit 项目的一部分。
// src/model/stub.rs - 确定性测试模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::time::Instant;

use image::RgbImage;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, info};

use crate::{
  model::{COCO_KEYPOINTS, COCO_SKELETON, EstimatorError, ModelOptions, OptionError, PoseEstimator},
  output::draw::{Draw, DrawError},
  pose::{BoundingBox, Keypoint, PoseData, PoseMetadata},
};

const STUB_MODEL_NAME: &str = "StubPoseEstimator";

// 站立人体的归一化模板坐标，顺序与 COCO_KEYPOINTS 一致
const STUB_TEMPLATE: [(f64, f64); 17] = [
  (0.50, 0.15),
  (0.48, 0.13),
  (0.52, 0.13),
  (0.46, 0.14),
  (0.54, 0.14),
  (0.42, 0.28),
  (0.58, 0.28),
  (0.38, 0.42),
  (0.62, 0.42),
  (0.36, 0.55),
  (0.64, 0.55),
  (0.45, 0.58),
  (0.55, 0.58),
  (0.44, 0.74),
  (0.56, 0.74),
  (0.44, 0.90),
  (0.56, 0.90),
];

const STUB_SWAY: f64 = 0.03;
const STUB_JITTER: f64 = 0.01;

/// 生成合成关键点的模型，不依赖任何外部模型文件
///
/// 输出只由 `seed` 与调用次数决定，同样的输入序列总是得到同样的关键点。
/// 初始化之后既不会返回空结果，也不会失败。
pub struct StubEstimator {
  seed: u64,
  confidence_threshold: f64,
  draw: Draw,
  initialized: bool,
  calls: u64,
}

impl StubEstimator {
  pub fn new(seed: u64, confidence_threshold: f64) -> Self {
    Self {
      seed,
      confidence_threshold,
      draw: Draw::default()
        .with_confidence_threshold(confidence_threshold)
        .with_banner(format!("Model: {}", STUB_MODEL_NAME)),
      initialized: false,
      calls: 0,
    }
  }

  /// 读取参数 `seed`、`confidence_threshold`、`font`
  pub fn from_options(options: &ModelOptions) -> Result<Self, StubOptionError> {
    let seed = options.get_or("seed", 0u64)?;
    let threshold = options.get_unit("confidence_threshold", 0.5)?;
    let mut estimator = Self::new(seed, threshold);
    if let Some(font) = options.get_str("font") {
      estimator.draw = estimator.draw.with_font_file(font)?;
    }
    Ok(estimator)
  }

  fn keypoints(&self, width: u32, height: u32) -> Vec<Keypoint> {
    let phase = self.calls as f64 * 0.2 + (self.seed % 360) as f64;
    COCO_KEYPOINTS
      .iter()
      .zip(STUB_TEMPLATE)
      .enumerate()
      .map(|(i, (name, (tx, ty)))| {
        let mut rng = StdRng::seed_from_u64(self.seed ^ (self.calls << 8) ^ i as u64);
        let sway = STUB_SWAY * (phase + i as f64 * 0.1).sin();
        let x = tx + sway + rng.gen_range(-STUB_JITTER..=STUB_JITTER);
        let y = ty + rng.gen_range(-STUB_JITTER..=STUB_JITTER);
        let confidence = rng.gen_range(self.confidence_threshold..=1.0);
        Keypoint::from_normalized(i as u32, *name, x, y, confidence, width, height)
      })
      .collect()
  }
}

#[derive(thiserror::Error, Debug)]
pub enum StubOptionError {
  #[error(transparent)]
  Option(#[from] OptionError),
  #[error(transparent)]
  Font(#[from] DrawError),
}

impl PoseEstimator for StubEstimator {
  fn name(&self) -> &str {
    STUB_MODEL_NAME
  }

  fn initialize(&mut self) -> Result<(), EstimatorError> {
    if self.initialized {
      return Err(EstimatorError::AlreadyInitialized);
    }
    info!("初始化测试模型, seed = {}", self.seed);
    self.calls = 0;
    self.initialized = true;
    Ok(())
  }

  fn detect_pose(&mut self, frame: &RgbImage) -> Result<Option<PoseData>, EstimatorError> {
    if !self.initialized {
      return Err(EstimatorError::NotInitialized);
    }
    let now = Instant::now();
    let (width, height) = frame.dimensions();
    let keypoints = self.keypoints(width, height);
    self.calls += 1;

    let bbox = BoundingBox::enclosing(&keypoints, self.confidence_threshold);
    let elapsed = now.elapsed().as_secs_f64();
    debug!("测试模型生成 {} 个关键点", keypoints.len());

    Ok(Some(PoseData {
      keypoints,
      bbox,
      metadata: PoseMetadata::new(STUB_MODEL_NAME, elapsed)
        .with("confidence_threshold", self.confidence_threshold)
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
    debug!("释放测试模型");
    self.initialized = false;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detect_before_initialize_fails() {
    let mut stub = StubEstimator::new(0, 0.5);
    let frame = RgbImage::new(32, 32);
    assert!(matches!(
      stub.detect_pose(&frame),
      Err(EstimatorError::NotInitialized)
    ));
  }

  #[test]
  fn initialize_only_once() {
    let mut stub = StubEstimator::new(0, 0.5);
    stub.initialize().unwrap();
    assert!(matches!(
      stub.initialize(),
      Err(EstimatorError::AlreadyInitialized)
    ));
  }

  #[test]
  fn always_detects_full_keypoint_set() {
    let mut stub = StubEstimator::new(3, 0.5);
    stub.initialize().unwrap();
    let frame = RgbImage::new(64, 48);
    for _ in 0..20 {
      let pose = stub.detect_pose(&frame).unwrap().expect("stub never misses");
      assert_eq!(pose.keypoints.len(), COCO_KEYPOINTS.len());
      stub.validate_pose_data(&pose).unwrap();
      for kp in &pose.keypoints {
        assert!((0.0..=1.0).contains(&kp.x) && (0.0..=1.0).contains(&kp.y));
        assert!(kp.confidence >= 0.5 && kp.confidence <= 1.0);
        assert!(kp.pixel_x < 64 && kp.pixel_y < 48);
      }
    }
  }

  #[test]
  fn same_seed_same_keypoints() {
    let frame = RgbImage::new(64, 48);
    let run = |seed| {
      let mut stub = StubEstimator::new(seed, 0.5);
      stub.initialize().unwrap();
      (0..5)
        .map(|_| stub.detect_pose(&frame).unwrap().unwrap().keypoints)
        .collect::<Vec<_>>()
    };
    assert_eq!(run(11), run(11));
    assert_ne!(run(11), run(12));
  }

  #[test]
  fn confidence_stays_between_threshold_and_one() {
    let frame = RgbImage::new(64, 48);
    for threshold in [0.0, 0.9, 1.0] {
      let mut stub = StubEstimator::new(5, threshold);
      stub.initialize().unwrap();
      let pose = stub.detect_pose(&frame).unwrap().unwrap();
      assert!(
        pose
          .keypoints
          .iter()
          .all(|kp| (threshold..=1.0).contains(&kp.confidence))
      );
    }
  }

  #[test]
  fn options_are_validated() {
    let options = ModelOptions::new().set("confidence_threshold", "2");
    assert!(matches!(
      StubEstimator::from_options(&options),
      Err(StubOptionError::Option(_))
    ));
    let options = ModelOptions::new().set("font", "/nonexistent.ttf");
    assert!(matches!(
      StubEstimator::from_options(&options),
      Err(StubOptionError::Font(_))
    ));
  }

  #[test]
  fn model_info_lists_keypoints() {
    let stub = StubEstimator::new(0, 0.5);
    let info = stub.model_info();
    assert_eq!(info.name, STUB_MODEL_NAME);
    assert_eq!(info.num_keypoints, 17);
    assert_eq!(info.keypoint_names[0], "nose");
  }
}
