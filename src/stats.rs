// 该文件是 Posekit 项目的一部分。
// src/stats.rs - 处理统计
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

use std::time::Duration;

use crate::pose::{PoseFrame, ProcessingStats};

/// 统计累加器
///
/// 增量更新与 [`StatsAggregator::from_frames`] 对同一帧序列给出相同的结果。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsAggregator {
  total_frames: u64,
  frames_with_pose: u64,
  frames_failed_detection: u64,
}

impl StatsAggregator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a PoseFrame>) -> Self {
    frames.into_iter().fold(Self::new(), |mut acc, frame| {
      acc.update(frame);
      acc
    })
  }

  pub fn update(&mut self, frame: &PoseFrame) {
    self.total_frames += 1;
    if frame.pose_detected {
      self.frames_with_pose += 1;
    }
    if frame.detection_failed() {
      self.frames_failed_detection += 1;
    }
  }

  pub fn total_frames(&self) -> u64 {
    self.total_frames
  }

  pub fn frames_with_pose(&self) -> u64 {
    self.frames_with_pose
  }

  pub fn frames_failed_detection(&self) -> u64 {
    self.frames_failed_detection
  }

  /// 由墙钟时间得到最终统计
  pub fn finish(&self, wall_clock: Duration) -> ProcessingStats {
    let seconds = wall_clock.as_secs_f64();
    ProcessingStats {
      total_frames: self.total_frames,
      frames_with_pose: self.frames_with_pose,
      frames_failed_detection: self.frames_failed_detection,
      pose_detection_rate: ratio(self.frames_with_pose as f64, self.total_frames as f64),
      avg_fps: ratio(self.total_frames as f64, seconds),
      total_processing_time: seconds,
    }
  }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
  if denominator > 0.0 {
    numerator / denominator
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::EstimatorError;
  use crate::pose::{FrameOutcome, PoseData, PoseMetadata};

  fn detected(n: u64) -> PoseFrame {
    let pose = PoseData {
      keypoints: Vec::new(),
      bbox: None,
      metadata: PoseMetadata::new("test", 0.0),
    };
    PoseFrame::new(n, 10.0, 0.0, FrameOutcome::Detected(pose))
  }

  fn sequence() -> Vec<PoseFrame> {
    vec![
      detected(0),
      PoseFrame::new(1, 10.0, 0.0, FrameOutcome::NoPose),
      detected(2),
      PoseFrame::new(
        3,
        10.0,
        0.0,
        FrameOutcome::Failed(EstimatorError::Inference("x".into())),
      ),
    ]
  }

  #[test]
  fn empty_sequence_has_zero_rates() {
    let stats = StatsAggregator::new().finish(Duration::ZERO);
    assert_eq!(stats.total_frames, 0);
    assert_eq!(stats.pose_detection_rate, 0.0);
    assert_eq!(stats.avg_fps, 0.0);
  }

  #[test]
  fn counts_detected_and_failed_frames() {
    let stats = StatsAggregator::from_frames(&sequence()).finish(Duration::from_secs(2));
    assert_eq!(stats.total_frames, 4);
    assert_eq!(stats.frames_with_pose, 2);
    assert_eq!(stats.frames_failed_detection, 1);
    assert_eq!(stats.pose_detection_rate, 0.5);
    assert_eq!(stats.avg_fps, 2.0);
  }

  #[test]
  fn incremental_matches_fold() {
    let frames = sequence();
    let mut running = StatsAggregator::new();
    for frame in &frames {
      running.update(frame);
    }
    assert_eq!(running, StatsAggregator::from_frames(&frames));
  }
}
