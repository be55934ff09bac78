// 该文件是 Posekit 项目的一部分。
// src/task.rs - 逐帧姿态处理任务
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

//! 视频处理的状态机：
//!
//! ```text
//! Init -> Opened -> Running -> Finalizing -> Done
//!   \        \          \            \
//!    `--------`----------`------------`---> Failed
//! ```
//!
//! 帧严格按顺序处理。模型、视频输入与标注输出在进入 `Opened` 时获得，
//! 离开 `Running` 的每条路径上都只释放一次。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{Local, TimeDelta};
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  input::{FrameSource, SourceError, SourceWrapper},
  model::{ModelOptions, PoseEstimator},
  output::{
    FrameSink, SinkWrapper,
    report::{ReportWriter, WriteError, report_file_name},
  },
  pose::{FrameOutcome, ModelInfo, PoseFrame, Report, VideoInfo},
  registry::{ConfigError, EstimatorRegistry},
  stats::StatsAggregator,
};

/// 每隔多少帧输出一次进度日志
const PROGRESS_INTERVAL: u64 = 100;

/// 进度回调，参数为刚处理完的帧号与视频声明的总帧数
///
/// 回调只用于展示进度，不影响处理结果。需要中途停止时，
/// 在回调里调用 [`StopHandle::request_stop`]。
pub type ProgressCallback<'a> = Box<dyn FnMut(u64, u64) + Send + 'a>;

/// 需要写出的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessFlags {
  pub save_annotated_video: bool,
  pub save_report: bool,
}

impl Default for ProcessFlags {
  fn default() -> Self {
    Self {
      save_annotated_video: true,
      save_report: true,
    }
  }
}

impl ProcessFlags {
  fn writes_anything(&self) -> bool {
    self.save_annotated_video || self.save_report
  }
}

/// 请求停止处理，可在其他线程或信号处理函数中使用
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn request_stop(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_stop_requested(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
  Init,
  Opened,
  Running,
  Finalizing,
  Done,
  Failed,
}

impl ProcessState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, ProcessState::Done | ProcessState::Failed)
  }
}

impl fmt::Display for ProcessState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ProcessState::Init => "INIT",
      ProcessState::Opened => "OPENED",
      ProcessState::Running => "RUNNING",
      ProcessState::Finalizing => "FINALIZING",
      ProcessState::Done => "DONE",
      ProcessState::Failed => "FAILED",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("模型 {model} 配置错误: {source}")]
  Configuration {
    model: String,
    #[source]
    source: ConfigError,
  },
  #[error("模型 {model}: 无法打开视频: {source}")]
  VideoOpen {
    model: String,
    #[source]
    source: SourceError,
  },
  #[error("模型 {model}: 第 {frame} 帧解码失败: {source}")]
  FrameDecode {
    model: String,
    frame: u64,
    #[source]
    source: SourceError,
    /// 失败之前已处理的帧，`incomplete` 为 true
    partial: Box<Report>,
  },
  #[error("模型 {model}: 写出结果失败: {source}")]
  Write {
    model: String,
    frame: Option<u64>,
    #[source]
    source: WriteError,
  },
}

impl ProcessError {
  pub fn model(&self) -> &str {
    match self {
      ProcessError::Configuration { model, .. }
      | ProcessError::VideoOpen { model, .. }
      | ProcessError::FrameDecode { model, .. }
      | ProcessError::Write { model, .. } => model,
    }
  }

  /// 出错时的帧号
  pub fn frame(&self) -> Option<u64> {
    match self {
      ProcessError::FrameDecode { frame, .. } => Some(*frame),
      ProcessError::Write { frame, .. } => *frame,
      _ => None,
    }
  }

  /// 解码失败时已处理部分的报告
  pub fn partial_report(&self) -> Option<&Report> {
    match self {
      ProcessError::FrameDecode { partial, .. } => Some(partial),
      _ => None,
    }
  }
}

/// 处理循环结束的原因
enum LoopEnd {
  Exhausted,
  FrameLimit,
  Cancelled,
  Decode(u64, SourceError),
  Write(u64, WriteError),
}

/// 单个视频的处理任务
///
/// ```no_run
/// use posekit::{registry::EstimatorRegistry, task::FrameProcessor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = EstimatorRegistry::with_builtin();
/// let report = FrameProcessor::new(&registry, "stub")
///   .with_output_dir("results")
///   .with_max_frames(Some(300))
///   .process("squat.mp4")?;
/// println!("{:.1}%", report.processing_stats.pose_detection_rate * 100.0);
/// # Ok(())
/// # }
/// ```
pub struct FrameProcessor<'a> {
  registry: &'a EstimatorRegistry,
  model_id: String,
  options: ModelOptions,
  output_dir: PathBuf,
  flags: ProcessFlags,
  max_frames: Option<u64>,
  stop: StopHandle,
  progress: Option<ProgressCallback<'a>>,
  state: ProcessState,
}

impl<'a> FrameProcessor<'a> {
  pub fn new(registry: &'a EstimatorRegistry, model_id: &str) -> Self {
    Self {
      registry,
      model_id: model_id.to_string(),
      options: ModelOptions::new(),
      output_dir: PathBuf::from("."),
      flags: ProcessFlags::default(),
      max_frames: None,
      stop: StopHandle::new(),
      progress: None,
      state: ProcessState::Init,
    }
  }

  pub fn with_options(mut self, options: ModelOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_output_dir(mut self, output_dir: impl AsRef<Path>) -> Self {
    self.output_dir = output_dir.as_ref().to_path_buf();
    self
  }

  pub fn with_flags(mut self, flags: ProcessFlags) -> Self {
    self.flags = flags;
    self
  }

  /// 最多处理的帧数，`None` 表示处理到视频结束
  pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
    self.max_frames = max_frames;
    self
  }

  pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
    self.stop = stop;
    self
  }

  pub fn with_progress(mut self, progress: impl FnMut(u64, u64) + Send + 'a) -> Self {
    self.progress = Some(Box::new(progress));
    self
  }

  pub fn stop_handle(&self) -> StopHandle {
    self.stop.clone()
  }

  /// 用注册表中的模型处理 `location` 指向的视频
  pub fn process(mut self, location: &str) -> Result<Report, ProcessError> {
    info!("处理视频 {}, 模型 {}", location, self.model_id);
    let estimator = match self.registry.create(&self.model_id, &self.options) {
      Ok(estimator) => estimator,
      Err(source) => return Err(self.fail_configuration(source)),
    };
    self.run(estimator, || SourceWrapper::open(location))
  }

  /// 用给定的模型与视频输入运行，`open` 在模型初始化之后调用
  pub fn run<E, S, F>(mut self, mut estimator: E, open: F) -> Result<Report, ProcessError>
  where
    E: PoseEstimator,
    S: FrameSource,
    F: FnOnce() -> Result<S, SourceError>,
  {
    // INIT -> OPENED
    if let Err(e) = estimator.initialize() {
      estimator.cleanup();
      return Err(self.fail_configuration(ConfigError::Initialization(e)));
    }
    let model_info = estimator.model_info();
    info!(
      "模型 {} 初始化完成, {} 个关键点",
      model_info.name, model_info.num_keypoints
    );

    let mut source = match open() {
      Ok(source) => source,
      Err(source_error) => {
        estimator.cleanup();
        self.transition(ProcessState::Failed);
        error!("无法打开视频: {}", source_error);
        return Err(ProcessError::VideoOpen {
          model: self.model_id.clone(),
          source: source_error,
        });
      }
    };
    let video_info = source.video_info().clone();
    let stem = source.stem().to_string();

    let (mut report_writer, mut sink) = match self.open_outputs(&video_info, &model_info, &stem) {
      Ok(outputs) => outputs,
      Err(e) => {
        source.close();
        estimator.cleanup();
        self.transition(ProcessState::Failed);
        error!("无法创建输出: {}", e);
        return Err(ProcessError::Write {
          model: self.model_id.clone(),
          frame: None,
          source: e,
        });
      }
    };
    self.transition(ProcessState::Opened);

    // OPENED -> RUNNING
    self.transition(ProcessState::Running);
    let started = Instant::now();
    let mut stats = StatsAggregator::new();
    let mut frames = Vec::new();
    let mut frame_number = 0u64;

    let end = loop {
      if self.max_frames.is_some_and(|limit| frame_number >= limit) {
        info!("达到指定帧数 {}, 停止处理", frame_number);
        break LoopEnd::FrameLimit;
      }
      if self.stop.is_stop_requested() {
        warn!("收到停止请求, 已处理 {} 帧", frame_number);
        break LoopEnd::Cancelled;
      }
      let frame = match source.next() {
        None => break LoopEnd::Exhausted,
        Some(Err(e)) => break LoopEnd::Decode(frame_number, e),
        Some(Ok(frame)) => frame,
      };

      let now = Instant::now();
      let outcome = detect(&mut estimator, &frame);
      let processing_time = now.elapsed().as_secs_f64();
      if let FrameOutcome::Failed(e) = &outcome {
        warn!("第 {} 帧姿态检测失败: {}", frame_number, e);
      }

      if let Some(sink) = sink.as_mut() {
        let written = match outcome.pose() {
          Some(pose) => sink.write_frame(&estimator.draw_pose(&frame, pose)),
          None => sink.write_frame(&frame),
        };
        if let Err(e) = written {
          break LoopEnd::Write(frame_number, e.into());
        }
      }

      let record = PoseFrame::new(frame_number, video_info.fps, processing_time, outcome);
      stats.update(&record);
      if let Some(writer) = report_writer.as_mut()
        && let Err(e) = writer.write_frame(&record)
      {
        break LoopEnd::Write(frame_number, e);
      }
      frames.push(record);

      if let Some(progress) = self.progress.as_mut() {
        progress(frame_number, video_info.total_frames);
      }
      if (frame_number + 1) % PROGRESS_INTERVAL == 0 {
        log_progress(frame_number + 1, video_info.total_frames, &stats, started);
      }
      frame_number += 1;
    };

    // RUNNING -> FINALIZING
    self.transition(ProcessState::Finalizing);
    source.close();
    let sink_result = sink.map(|mut sink| {
      let finished = sink.finish();
      debug!("标注输出共 {} 帧", sink.frames_written());
      finished.map(|_| sink.path().to_path_buf())
    });
    estimator.cleanup();

    let processing_stats = stats.finish(started.elapsed());
    info!(
      "处理结束: {} 帧, 检测到姿态 {} 帧 ({:.1}%), 平均 {:.2} fps",
      processing_stats.total_frames,
      processing_stats.frames_with_pose,
      processing_stats.pose_detection_rate * 100.0,
      processing_stats.avg_fps
    );
    let incomplete = matches!(end, LoopEnd::Cancelled | LoopEnd::Decode(..));
    let mut report = Report {
      video_info,
      model_info,
      processing_stats,
      frames,
      incomplete,
      artifacts: Default::default(),
    };

    match end {
      LoopEnd::Write(frame, source) => {
        if let Some(Err(e)) = sink_result {
          warn!("关闭标注输出失败: {}", e);
        }
        drop(report_writer);
        self.transition(ProcessState::Failed);
        error!("第 {} 帧写出失败: {}", frame, source);
        Err(ProcessError::Write {
          model: self.model_id.clone(),
          frame: Some(frame),
          source,
        })
      }
      LoopEnd::Decode(frame, source) => {
        match sink_result {
          Some(Ok(path)) => report.artifacts.annotated_video_path = Some(path),
          Some(Err(e)) => warn!("关闭标注输出失败: {}", e),
          None => {}
        }
        if let Some(writer) = report_writer.take() {
          match writer.finish(&report.processing_stats, true) {
            Ok(path) => report.artifacts.report_path = Some(path),
            Err(e) => warn!("无法保存部分报告: {}", e),
          }
        }
        self.transition(ProcessState::Failed);
        error!("第 {} 帧解码失败: {}", frame, source);
        Err(ProcessError::FrameDecode {
          model: self.model_id.clone(),
          frame,
          source,
          partial: Box::new(report),
        })
      }
      LoopEnd::Exhausted | LoopEnd::FrameLimit | LoopEnd::Cancelled => {
        let finished = sink_result
          .transpose()
          .map_err(WriteError::from)
          .and_then(|video| {
            let report_path = report_writer
              .take()
              .map(|writer| writer.finish(&report.processing_stats, incomplete))
              .transpose()?;
            Ok((video, report_path))
          });
        match finished {
          Ok((video, report_path)) => {
            report.artifacts.annotated_video_path = video;
            report.artifacts.report_path = report_path;
            self.transition(ProcessState::Done);
            Ok(report)
          }
          Err(source) => {
            self.transition(ProcessState::Failed);
            error!("写出结果失败: {}", source);
            Err(ProcessError::Write {
              model: self.model_id.clone(),
              frame: None,
              source,
            })
          }
        }
      }
    }
  }

  fn open_outputs(
    &self,
    video_info: &VideoInfo,
    model_info: &ModelInfo,
    stem: &str,
  ) -> Result<(Option<ReportWriter>, Option<SinkWrapper>), WriteError> {
    if !self.flags.writes_anything() {
      return Ok((None, None));
    }
    std::fs::create_dir_all(&self.output_dir).map_err(|source| WriteError::Report {
      path: self.output_dir.clone(),
      source,
    })?;

    let report_writer = if self.flags.save_report {
      let path = self.output_dir.join(report_file_name(stem));
      Some(ReportWriter::create(path, video_info, model_info)?)
    } else {
      None
    };

    let sink = if !self.flags.save_annotated_video {
      None
    } else if video_info.width == 0 || video_info.height == 0 {
      warn!("视频没有可用的帧, 不生成标注视频");
      None
    } else {
      Some(SinkWrapper::annotated(
        &self.output_dir,
        stem,
        video_info.width,
        video_info.height,
        video_info.fps,
      )?)
    };
    Ok((report_writer, sink))
  }

  fn fail_configuration(&mut self, source: ConfigError) -> ProcessError {
    self.transition(ProcessState::Failed);
    error!("模型 {} 配置错误: {}", self.model_id, source);
    ProcessError::Configuration {
      model: self.model_id.clone(),
      source,
    }
  }

  fn transition(&mut self, next: ProcessState) {
    debug_assert!(!self.state.is_terminal(), "{} 是终止状态", self.state);
    info!("状态: {} -> {}", self.state, next);
    self.state = next;
  }
}

/// 运行一帧推理并把结果归为三种情况之一
fn detect<E: PoseEstimator>(estimator: &mut E, frame: &RgbImage) -> FrameOutcome {
  match estimator.detect_pose(frame) {
    Ok(Some(pose)) => match estimator.validate_pose_data(&pose) {
      Ok(()) => FrameOutcome::Detected(pose),
      Err(e) => FrameOutcome::Failed(e),
    },
    Ok(None) => FrameOutcome::NoPose,
    Err(e) => FrameOutcome::Failed(e),
  }
}

fn log_progress(done: u64, total: u64, stats: &StatsAggregator, started: Instant) {
  let elapsed = started.elapsed().as_secs_f64();
  let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
  if total > done && rate > 0.0 {
    let remaining = (total - done) as f64 / rate;
    let finish_at = TimeDelta::try_milliseconds((remaining * 1000.0) as i64)
      .map(|delta| (Local::now() + delta).format("%H:%M:%S").to_string())
      .unwrap_or_default();
    info!(
      "进度: {}/{} ({:.1}%), 检测到姿态 {} 帧, {:.1} fps, 剩余约 {:.0} 秒 (预计 {} 完成)",
      done,
      total,
      done as f64 * 100.0 / total as f64,
      stats.frames_with_pose(),
      rate,
      remaining,
      finish_at
    );
  } else {
    info!(
      "进度: 已处理 {} 帧, 检测到姿态 {} 帧, {:.1} fps",
      done,
      stats.frames_with_pose(),
      rate
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stop_handle_is_shared_between_clones() {
    let handle = StopHandle::new();
    let clone = handle.clone();
    assert!(!handle.is_stop_requested());
    clone.request_stop();
    assert!(handle.is_stop_requested());
  }

  #[test]
  fn only_done_and_failed_are_terminal() {
    assert!(ProcessState::Done.is_terminal());
    assert!(ProcessState::Failed.is_terminal());
    assert!(!ProcessState::Finalizing.is_terminal());
    assert_eq!(ProcessState::Running.to_string(), "RUNNING");
  }

  #[test]
  fn flags_default_to_writing_everything() {
    let flags = ProcessFlags::default();
    assert!(flags.save_annotated_video && flags.save_report);
    assert!(
      !ProcessFlags {
        save_annotated_video: false,
        save_report: false
      }
      .writes_anything()
    );
  }
}
