// 该文件是 Posekit 项目的一部分。
// src/pose.rs - 关键点与帧数据模型
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 关键点报告中的数据结构。
//!
//! 这里的每个结构在一次处理过程中只创建一次，追加到报告之后不再修改。
//! 字段名即持久化 JSON 的字段名，下游分析依赖这些名字，不要随意改动。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::EstimatorError;

/// 单个关键点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
  /// 关键点在模型关键点集合中的索引
  pub id: u32,
  pub name: String,
  /// 归一化坐标，范围 [0, 1]
  pub x: f64,
  pub y: f64,
  /// 置信度，范围 [0, 1]
  pub confidence: f64,
  /// 像素坐标，满足 0 <= pixel_x < width
  pub pixel_x: u32,
  pub pixel_y: u32,
}

impl Keypoint {
  /// 由归一化坐标构造关键点，越界的坐标会被截断到图像范围内
  pub fn from_normalized(
    id: u32,
    name: impl Into<String>,
    x: f64,
    y: f64,
    confidence: f64,
    frame_width: u32,
    frame_height: u32,
  ) -> Self {
    let x = sanitize_unit(x);
    let y = sanitize_unit(y);
    Self {
      id,
      name: name.into(),
      x,
      y,
      confidence: sanitize_unit(confidence),
      pixel_x: to_pixel(x, frame_width),
      pixel_y: to_pixel(y, frame_height),
    }
  }
}

fn sanitize_unit(v: f64) -> f64 {
  if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

fn to_pixel(v: f64, extent: u32) -> u32 {
  let max = extent.saturating_sub(1);
  ((v * extent as f64).floor() as u32).min(max)
}

/// 主体所在区域（像素坐标）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl BoundingBox {
  /// 包围所有置信度高于阈值的关键点，没有满足条件的关键点时返回 None
  pub fn enclosing(keypoints: &[Keypoint], threshold: f64) -> Option<Self> {
    let mut confident = keypoints.iter().filter(|kp| kp.confidence > threshold);
    let first = confident.next()?;
    let init = (first.pixel_x, first.pixel_y, first.pixel_x, first.pixel_y);
    let (x_min, y_min, x_max, y_max) = confident.fold(init, |(x0, y0, x1, y1), kp| {
      (
        x0.min(kp.pixel_x),
        y0.min(kp.pixel_y),
        x1.max(kp.pixel_x),
        y1.max(kp.pixel_y),
      )
    });
    Some(Self {
      x: x_min,
      y: y_min,
      width: x_max - x_min,
      height: y_max - y_min,
    })
  }
}

/// 模型相关的附加信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseMetadata {
  pub model_name: String,
  /// 本帧推理耗时（秒）
  pub processing_time: f64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl PoseMetadata {
  pub fn new(model_name: impl Into<String>, processing_time: f64) -> Self {
    Self {
      model_name: model_name.into(),
      processing_time,
      extra: Map::new(),
    }
  }

  pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
    self.extra.insert(key.to_string(), value.into());
    self
  }
}

/// 单帧检测输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseData {
  pub keypoints: Vec<Keypoint>,
  pub bbox: Option<BoundingBox>,
  pub metadata: PoseMetadata,
}

/// 单帧推理的结果
///
/// 没有检测到姿态是正常结果，推理失败是可恢复的错误，两者都不会中断处理循环。
#[derive(Debug)]
pub enum FrameOutcome {
  Detected(PoseData),
  NoPose,
  Failed(EstimatorError),
}

impl FrameOutcome {
  pub fn pose(&self) -> Option<&PoseData> {
    match self {
      FrameOutcome::Detected(pose) => Some(pose),
      _ => None,
    }
  }
}

/// 报告中的一帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
  pub frame_number: u64,
  /// 秒，等于 frame_number / fps
  pub timestamp: f64,
  pub pose_detected: bool,
  /// 本帧推理耗时（秒）
  pub processing_time: f64,
  pub pose_data: Option<PoseData>,
  /// 推理失败时的错误描述
  pub detection_error: Option<String>,
}

impl PoseFrame {
  pub fn new(frame_number: u64, fps: f64, processing_time: f64, outcome: FrameOutcome) -> Self {
    let (pose_data, detection_error) = match outcome {
      FrameOutcome::Detected(pose) => (Some(pose), None),
      FrameOutcome::NoPose => (None, None),
      FrameOutcome::Failed(err) => (None, Some(err.to_string())),
    };
    Self {
      frame_number,
      timestamp: frame_timestamp(frame_number, fps),
      pose_detected: pose_data.is_some(),
      processing_time,
      pose_data,
      detection_error,
    }
  }

  /// 未检测到姿态时为空
  pub fn keypoints(&self) -> &[Keypoint] {
    self
      .pose_data
      .as_ref()
      .map(|pose| pose.keypoints.as_slice())
      .unwrap_or(&[])
  }

  pub fn detection_failed(&self) -> bool {
    self.detection_error.is_some()
  }
}

pub fn frame_timestamp(frame_number: u64, fps: f64) -> f64 {
  if fps > 0.0 {
    frame_number as f64 / fps
  } else {
    0.0
  }
}

/// 打开视频时得到的视频属性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
  pub path: String,
  pub width: u32,
  pub height: u32,
  pub fps: f64,
  /// 容器声明的帧数，未知时为 0
  pub total_frames: u64,
}

/// 模型初始化后得到的模型属性
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
  pub name: String,
  #[serde(rename = "keypoints")]
  pub keypoint_names: Vec<String>,
  pub num_keypoints: usize,
}

impl ModelInfo {
  pub fn new(name: impl Into<String>, keypoint_names: &[&str]) -> Self {
    Self {
      name: name.into(),
      keypoint_names: keypoint_names.iter().map(|s| s.to_string()).collect(),
      num_keypoints: keypoint_names.len(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
  pub total_frames: u64,
  pub frames_with_pose: u64,
  pub frames_failed_detection: u64,
  pub pose_detection_rate: f64,
  pub avg_fps: f64,
  /// 墙钟时间（秒）
  pub total_processing_time: f64,
}

/// 一次处理的完整结果，也是持久化到磁盘的单位
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
  pub video_info: VideoInfo,
  pub model_info: ModelInfo,
  pub processing_stats: ProcessingStats,
  pub frames: Vec<PoseFrame>,
  /// 处理被解码错误或取消打断时为 true
  #[serde(default)]
  pub incomplete: bool,
  #[serde(skip)]
  pub artifacts: Artifacts,
}

/// 本次处理写出的文件
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifacts {
  pub report_path: Option<PathBuf>,
  pub annotated_video_path: Option<PathBuf>,
}

impl Report {
  /// 读取已保存的关键点报告
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ReportLoadError> {
    let file = std::fs::File::open(path.as_ref())?;
    let mut report: Report = serde_json::from_reader(std::io::BufReader::new(file))?;
    report.artifacts.report_path = Some(path.as_ref().to_path_buf());
    Ok(report)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ReportLoadError {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("报告格式错误: {0}")]
  Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
  use super::*;

  fn kp(id: u32, x: f64, y: f64, confidence: f64) -> Keypoint {
    Keypoint::from_normalized(id, format!("kp{id}"), x, y, confidence, 100, 50)
  }

  #[test]
  fn pixel_coordinates_stay_inside_frame() {
    let k = kp(0, 1.0, 1.0, 0.9);
    assert_eq!(k.pixel_x, 99);
    assert_eq!(k.pixel_y, 49);

    let k = kp(1, -0.2, 1.7, 1.4);
    assert_eq!((k.x, k.y, k.confidence), (0.0, 1.0, 1.0));
    assert_eq!((k.pixel_x, k.pixel_y), (0, 49));
  }

  #[test]
  fn bbox_only_covers_confident_keypoints() {
    let keypoints = vec![
      kp(0, 0.1, 0.2, 0.9),
      kp(1, 0.5, 0.8, 0.7),
      kp(2, 0.95, 0.95, 0.1),
    ];
    let bbox = BoundingBox::enclosing(&keypoints, 0.5).unwrap();
    assert_eq!(
      bbox,
      BoundingBox {
        x: 10,
        y: 10,
        width: 40,
        height: 30
      }
    );
    assert!(BoundingBox::enclosing(&keypoints, 0.95).is_none());
  }

  #[test]
  fn frame_without_pose_serializes_nulls() {
    let frame = PoseFrame::new(3, 30.0, 0.01, FrameOutcome::NoPose);
    assert!(frame.keypoints().is_empty());
    let value = serde_json::to_value(&frame).unwrap();
    assert_eq!(value["frame_number"], 3);
    assert_eq!(value["timestamp"], 0.1);
    assert_eq!(value["pose_detected"], false);
    assert!(value["pose_data"].is_null());
    assert!(value["detection_error"].is_null());
  }

  #[test]
  fn failed_detection_keeps_error_text() {
    let outcome = FrameOutcome::Failed(EstimatorError::Inference("boom".into()));
    let frame = PoseFrame::new(0, 25.0, 0.0, outcome);
    assert!(!frame.pose_detected);
    assert!(frame.detection_failed());
    assert!(frame.detection_error.unwrap().contains("boom"));
  }

  #[test]
  fn metadata_extras_are_flattened() {
    let pose = PoseData {
      keypoints: vec![kp(0, 0.5, 0.5, 0.8)],
      bbox: None,
      metadata: PoseMetadata::new("Stub", 0.002).with("model_complexity", 1),
    };
    let value = serde_json::to_value(&pose).unwrap();
    assert!(value["bbox"].is_null());
    assert_eq!(value["metadata"]["model_name"], "Stub");
    assert_eq!(value["metadata"]["model_complexity"], 1);
    let back: PoseData = serde_json::from_value(value).unwrap();
    assert_eq!(back, pose);
  }

  #[test]
  fn zero_fps_does_not_divide() {
    assert_eq!(frame_timestamp(10, 0.0), 0.0);
    assert_eq!(frame_timestamp(10, 20.0), 0.5);
  }
}
