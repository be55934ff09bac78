// 该文件是 Posekit 项目的一部分。
// src/model.rs - 姿态估计模型
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::BTreeMap;
use std::str::FromStr;

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::pose::{ModelInfo, PoseData};

/// 姿态估计能力
///
/// `initialize` 必须在其他方法之前调用且只调用一次。
/// `detect_pose` 找不到姿态时返回 `Ok(None)`，这不是错误。
pub trait PoseEstimator {
  fn name(&self) -> &str;

  fn initialize(&mut self) -> Result<(), EstimatorError>;

  fn detect_pose(&mut self, frame: &RgbImage) -> Result<Option<PoseData>, EstimatorError>;

  /// 在帧的副本上绘制骨架，原帧保持不变
  fn draw_pose(&self, frame: &RgbImage, pose: &PoseData) -> RgbImage;

  fn keypoint_names(&self) -> &[&'static str];

  fn connections(&self) -> &[(usize, usize)];

  fn cleanup(&mut self) {}

  fn model_info(&self) -> ModelInfo {
    ModelInfo::new(self.name(), self.keypoint_names())
  }

  /// 检查检测结果是否与模型声明的关键点集合一致
  fn validate_pose_data(&self, pose: &PoseData) -> Result<(), EstimatorError> {
    let expected = self.keypoint_names().len();
    if pose.keypoints.len() != expected {
      return Err(EstimatorError::KeypointCountMismatch {
        expected,
        actual: pose.keypoints.len(),
      });
    }
    if let Some((index, kp)) = pose
      .keypoints
      .iter()
      .enumerate()
      .find(|(i, kp)| kp.id as usize != *i)
    {
      return Err(EstimatorError::KeypointOrder { index, id: kp.id });
    }
    Ok(())
  }
}

#[derive(Error, Debug)]
pub enum EstimatorError {
  #[error("模型尚未初始化")]
  NotInitialized,
  #[error("模型重复初始化")]
  AlreadyInitialized,
  #[error("模型加载错误: {0}")]
  LoadFailed(String),
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("关键点数量不匹配: 期望 {expected}, 实际 {actual}")]
  KeypointCountMismatch { expected: usize, actual: usize },
  #[error("关键点顺序错误: 位置 {index} 的关键点编号为 {id}")]
  KeypointOrder { index: usize, id: u32 },
}

/// 模型参数无法解析
#[derive(Error, Debug, Clone, PartialEq)]
#[error("参数 {key} 的值 '{value}' 无效: {reason}")]
pub struct OptionError {
  pub key: String,
  pub value: String,
  pub reason: String,
}

/// 模型参数
///
/// 以字符串键值对保存，由各模型自行解析需要的参数。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOptions {
  values: BTreeMap<String, String>,
}

impl ModelOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.values.insert(key.into(), value.to_string());
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
    self.values.insert(key.into(), value.to_string());
  }

  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.values.get(key).map(String::as_str)
  }

  /// 取出并解析参数，不存在时返回 `Ok(None)`
  pub fn get<T>(&self, key: &str) -> Result<Option<T>, OptionError>
  where
    T: FromStr,
    T::Err: std::fmt::Display,
  {
    match self.values.get(key) {
      None => Ok(None),
      Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| OptionError {
        key: key.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
      }),
    }
  }

  pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, OptionError>
  where
    T: FromStr,
    T::Err: std::fmt::Display,
  {
    Ok(self.get(key)?.unwrap_or(default))
  }

  /// 取出 [0, 1] 范围内的浮点参数
  pub fn get_unit(&self, key: &str, default: f64) -> Result<f64, OptionError> {
    let value: f64 = self.get_or(key, default)?;
    if !(0.0..=1.0).contains(&value) {
      return Err(OptionError {
        key: key.to_string(),
        value: value.to_string(),
        reason: "取值范围应为 0.0 - 1.0".to_string(),
      });
    }
    Ok(value)
  }

  /// 用 `other` 中的参数覆盖当前参数
  pub fn merged(&self, other: &ModelOptions) -> ModelOptions {
    let mut values = self.values.clone();
    values.extend(other.values.iter().map(|(k, v)| (k.clone(), v.clone())));
    ModelOptions { values }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// 从 URL 查询参数读取，例如 `model:?seed=3&confidence_threshold=0.4`
  pub fn from_url(url: &Url) -> Self {
    Self {
      values: url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect(),
    }
  }
}

impl FromStr for ModelOptions {
  type Err = OptionError;

  /// 解析 `key=value,key=value` 形式的参数
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut options = ModelOptions::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
      let (key, value) = pair.split_once('=').ok_or_else(|| OptionError {
        key: pair.to_string(),
        value: String::new(),
        reason: "应为 key=value 形式".to_string(),
      })?;
      options.insert(key.trim(), value.trim());
    }
    Ok(options)
  }
}

/// COCO 格式的 17 个关键点
pub const COCO_KEYPOINTS: [&str; 17] = [
  "nose",
  "left_eye",
  "right_eye",
  "left_ear",
  "right_ear",
  "left_shoulder",
  "right_shoulder",
  "left_elbow",
  "right_elbow",
  "left_wrist",
  "right_wrist",
  "left_hip",
  "right_hip",
  "left_knee",
  "right_knee",
  "left_ankle",
  "right_ankle",
];

/// COCO 骨架连线
pub const COCO_SKELETON: [(usize, usize); 16] = [
  // 头部
  (0, 1),
  (0, 2),
  (1, 3),
  (2, 4),
  // 躯干
  (5, 6),
  (5, 11),
  (6, 12),
  (11, 12),
  // 左臂
  (5, 7),
  (7, 9),
  // 右臂
  (6, 8),
  (8, 10),
  // 左腿
  (11, 13),
  (13, 15),
  // 右腿
  (12, 14),
  (14, 16),
];

mod stub;
pub use self::stub::StubEstimator;

#[cfg(feature = "model_movenet")]
mod movenet;
#[cfg(feature = "model_movenet")]
pub use self::movenet::MoveNetEstimator;

/// 注册表能构造的全部模型
pub enum Estimator {
  Stub(StubEstimator),
  #[cfg(feature = "model_movenet")]
  MoveNet(Box<MoveNetEstimator>),
}

impl PoseEstimator for Estimator {
  fn name(&self) -> &str {
    match self {
      Estimator::Stub(m) => m.name(),
      #[cfg(feature = "model_movenet")]
      Estimator::MoveNet(m) => m.name(),
    }
  }

  fn initialize(&mut self) -> Result<(), EstimatorError> {
    match self {
      Estimator::Stub(m) => m.initialize(),
      #[cfg(feature = "model_movenet")]
      Estimator::MoveNet(m) => m.initialize(),
    }
  }

  fn detect_pose(&mut self, frame: &RgbImage) -> Result<Option<PoseData>, EstimatorError> {
    match self {
      Estimator::Stub(m) => m.detect_pose(frame),
      #[cfg(feature = "model_movenet")]
      Estimator::MoveNet(m) => m.detect_pose(frame),
    }
  }

  fn draw_pose(&self, frame: &RgbImage, pose: &PoseData) -> RgbImage {
    match self {
      Estimator::Stub(m) => m.draw_pose(frame, pose),
      #[cfg(feature = "model_movenet")]
      Estimator::MoveNet(m) => m.draw_pose(frame, pose),
    }
  }

  fn keypoint_names(&self) -> &[&'static str] {
    match self {
      Estimator::Stub(m) => m.keypoint_names(),
      #[cfg(feature = "model_movenet")]
      Estimator::MoveNet(m) => m.keypoint_names(),
    }
  }

  fn connections(&self) -> &[(usize, usize)] {
    match self {
      Estimator::Stub(m) => m.connections(),
      #[cfg(feature = "model_movenet")]
      Estimator::MoveNet(m) => m.connections(),
    }
  }

  fn cleanup(&mut self) {
    match self {
      Estimator::Stub(m) => m.cleanup(),
      #[cfg(feature = "model_movenet")]
      Estimator::MoveNet(m) => m.cleanup(),
    }
  }
}

impl From<StubEstimator> for Estimator {
  fn from(m: StubEstimator) -> Self {
    Estimator::Stub(m)
  }
}

#[cfg(feature = "model_movenet")]
impl From<MoveNetEstimator> for Estimator {
  fn from(m: MoveNetEstimator) -> Self {
    Estimator::MoveNet(Box::new(m))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn options_parse_typed_values() {
    let options: ModelOptions = "seed=7, confidence_threshold=0.25".parse().unwrap();
    assert_eq!(options.get::<u64>("seed").unwrap(), Some(7));
    assert_eq!(options.get_unit("confidence_threshold", 0.5).unwrap(), 0.25);
    assert_eq!(options.get::<u32>("missing").unwrap(), None);
    assert_eq!(options.get_or("missing", 3u32).unwrap(), 3);
  }

  #[test]
  fn invalid_option_reports_key() {
    let options = ModelOptions::new().set("seed", "abc");
    let err = options.get::<u64>("seed").unwrap_err();
    assert_eq!(err.key, "seed");
    assert_eq!(err.value, "abc");

    let options = ModelOptions::new().set("min_detection_confidence", 1.5);
    assert!(options.get_unit("min_detection_confidence", 0.5).is_err());

    assert!("seed".parse::<ModelOptions>().is_err());
  }

  #[test]
  fn merged_prefers_overrides() {
    let defaults = ModelOptions::new().set("seed", 0).set("confidence_threshold", 0.5);
    let merged = defaults.merged(&ModelOptions::new().set("seed", 9));
    assert_eq!(merged.get::<u64>("seed").unwrap(), Some(9));
    assert_eq!(merged.get_str("confidence_threshold"), Some("0.5"));
  }

  #[test]
  fn options_from_url_query() {
    let url = Url::parse("model:stub?seed=4&font=%2Ftmp%2Fa.ttf").unwrap();
    let options = ModelOptions::from_url(&url);
    assert_eq!(options.get_str("seed"), Some("4"));
    assert_eq!(options.get_str("font"), Some("/tmp/a.ttf"));
  }

  #[test]
  fn skeleton_indices_are_valid() {
    for (a, b) in COCO_SKELETON {
      assert!(a < COCO_KEYPOINTS.len());
      assert!(b < COCO_KEYPOINTS.len());
    }
  }
}
