// 该文件是 Posekit 项目的一部分。
// src/output/report.rs - 关键点报告流式写出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! 关键点报告在处理过程中逐帧写入磁盘，每帧占一行，
//! 统计信息在结束时追加。先写入 `<name>.part`，完成后再改名，
//! 因此目标路径上的文件总是完整的 JSON。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::output::SinkError;
use crate::pose::{ModelInfo, PoseFrame, ProcessingStats, VideoInfo};

#[derive(Error, Debug)]
pub enum WriteError {
  #[error("无法写入报告 {path}: {source}")]
  Report {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("报告序列化失败: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("无法写入标注视频: {0}")]
  Video(#[from] SinkError),
}

/// 报告文件名 `keypoints_<stem>.json`
pub fn report_file_name(stem: &str) -> String {
  format!("keypoints_{}.json", stem)
}

pub struct ReportWriter {
  path: PathBuf,
  part_path: PathBuf,
  writer: Option<BufWriter<File>>,
  frames_written: u64,
}

impl ReportWriter {
  /// 创建报告并写入视频与模型信息
  pub fn create(
    path: impl Into<PathBuf>,
    video_info: &VideoInfo,
    model_info: &ModelInfo,
  ) -> Result<Self, WriteError> {
    let path = path.into();
    let mut part_path = path.clone().into_os_string();
    part_path.push(".part");
    let part_path = PathBuf::from(part_path);

    let file = File::create(&part_path).map_err(|source| WriteError::Report {
      path: part_path.clone(),
      source,
    })?;
    let mut writer = Self {
      path,
      part_path,
      writer: Some(BufWriter::new(file)),
      frames_written: 0,
    };
    writer.write_raw("{\n  \"video_info\": ")?;
    writer.write_json(video_info)?;
    writer.write_raw(",\n  \"model_info\": ")?;
    writer.write_json(model_info)?;
    writer.write_raw(",\n  \"frames\": [")?;
    debug!("开始写入报告: {}", writer.part_path.display());
    Ok(writer)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn frames_written(&self) -> u64 {
    self.frames_written
  }

  pub fn write_frame(&mut self, frame: &PoseFrame) -> Result<(), WriteError> {
    let separator = if self.frames_written == 0 { "\n    " } else { ",\n    " };
    self.write_raw(separator)?;
    self.write_json(frame)?;
    self.frames_written += 1;
    Ok(())
  }

  /// 写入统计信息并把报告移动到最终路径
  pub fn finish(
    mut self,
    stats: &ProcessingStats,
    incomplete: bool,
  ) -> Result<PathBuf, WriteError> {
    let close = if self.frames_written == 0 { "],\n" } else { "\n  ],\n" };
    self.write_raw(close)?;
    self.write_raw("  \"processing_stats\": ")?;
    self.write_json(stats)?;
    self.write_raw(&format!(",\n  \"incomplete\": {}\n}}\n", incomplete))?;

    if let Err(e) = self.persist() {
      self.discard();
      return Err(e);
    }
    info!(
      "报告已保存: {} ({} 帧)",
      self.path.display(),
      self.frames_written
    );
    Ok(self.path.clone())
  }

  fn persist(&mut self) -> Result<(), WriteError> {
    if let Some(writer) = self.writer.take() {
      let file = writer.into_inner().map_err(|e| WriteError::Report {
        path: self.part_path.clone(),
        source: e.into_error(),
      })?;
      file.sync_all().map_err(|source| self.io_error(source))?;
    }
    std::fs::rename(&self.part_path, &self.path).map_err(|source| WriteError::Report {
      path: self.path.clone(),
      source,
    })
  }

  /// 删除未完成的 `.part` 文件
  fn discard(&self) {
    if let Err(e) = std::fs::remove_file(&self.part_path) {
      warn!("无法删除 {}: {}", self.part_path.display(), e);
    } else {
      debug!("已删除未完成的报告 {}", self.part_path.display());
    }
  }

  fn write_raw(&mut self, text: &str) -> Result<(), WriteError> {
    let result = match self.writer.as_mut() {
      Some(writer) => writer.write_all(text.as_bytes()),
      None => return Ok(()),
    };
    result.map_err(|source| self.io_error(source))
  }

  fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), WriteError> {
    let line = serde_json::to_string(value)?;
    self.write_raw(&line)
  }

  fn io_error(&self, source: std::io::Error) -> WriteError {
    WriteError::Report {
      path: self.part_path.clone(),
      source,
    }
  }
}

impl Drop for ReportWriter {
  /// 没有调用 `finish` 时删除未完成的文件
  fn drop(&mut self) {
    if self.writer.take().is_some() {
      self.discard();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::COCO_KEYPOINTS;
  use crate::pose::{FrameOutcome, Keypoint, PoseData, PoseMetadata, Report};

  fn video() -> VideoInfo {
    VideoInfo {
      path: "clip.mp4".to_string(),
      width: 20,
      height: 10,
      fps: 10.0,
      total_frames: 2,
    }
  }

  fn model() -> ModelInfo {
    ModelInfo::new("test", &COCO_KEYPOINTS[..2])
  }

  fn detected(n: u64) -> PoseFrame {
    let keypoints = vec![
      Keypoint::from_normalized(0, "nose", 0.5, 0.5, 0.9, 20, 10),
      Keypoint::from_normalized(1, "left_eye", 0.4, 0.4, 0.8, 20, 10),
    ];
    PoseFrame::new(
      n,
      10.0,
      0.01,
      FrameOutcome::Detected(PoseData {
        keypoints,
        bbox: None,
        metadata: PoseMetadata::new("test", 0.01),
      }),
    )
  }

  #[test]
  fn streamed_report_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(report_file_name("clip"));
    let mut writer = ReportWriter::create(&path, &video(), &model()).unwrap();
    writer.write_frame(&detected(0)).unwrap();
    writer
      .write_frame(&PoseFrame::new(1, 10.0, 0.0, FrameOutcome::NoPose))
      .unwrap();
    let stats = ProcessingStats {
      total_frames: 2,
      frames_with_pose: 1,
      pose_detection_rate: 0.5,
      ..Default::default()
    };
    let written = writer.finish(&stats, false).unwrap();
    assert_eq!(written, path);
    assert!(!dir.path().join("keypoints_clip.json.part").exists());

    let report = Report::load(&path).unwrap();
    assert_eq!(report.video_info, video());
    assert_eq!(report.model_info, model());
    assert_eq!(report.frames.len(), 2);
    assert_eq!(report.frames[0], detected(0));
    assert_eq!(report.processing_stats, stats);
    assert!(!report.incomplete);
  }

  #[test]
  fn empty_report_is_valid_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keypoints_empty.json");
    let writer = ReportWriter::create(&path, &video(), &model()).unwrap();
    writer.finish(&ProcessingStats::default(), true).unwrap();

    let value: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["frames"], serde_json::json!([]));
    assert_eq!(value["incomplete"], serde_json::json!(true));
    assert_eq!(value["processing_stats"]["pose_detection_rate"], 0.0);
  }

  #[test]
  fn dropped_writer_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keypoints_drop.json");
    {
      let mut writer = ReportWriter::create(&path, &video(), &model()).unwrap();
      writer.write_frame(&detected(0)).unwrap();
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
  }

  #[test]
  fn failed_rename_removes_part_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keypoints_busy.json");
    std::fs::create_dir_all(path.join("occupied")).unwrap();

    let mut writer = ReportWriter::create(&path, &video(), &model()).unwrap();
    writer.write_frame(&detected(0)).unwrap();
    let err = writer.finish(&ProcessingStats::default(), false).unwrap_err();

    assert!(matches!(err, WriteError::Report { .. }));
    assert!(!dir.path().join("keypoints_busy.json.part").exists());
    assert!(path.is_dir());
  }
}
