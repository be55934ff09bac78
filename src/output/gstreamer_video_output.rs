// 该文件是 Posekit 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频文件输出模块
//!
//! 将标注后的帧逐帧编码为视频文件，容器由扩展名决定。
//!
//! ## 支持的格式
//!
//! - **MP4** (H.264) - 默认格式
//! - **MKV** (Matroska)
//! - **AVI**
//! - **WebM** (VP8)
//!
//! ## URL Scheme
//!
//! `gstvideo:///output.mp4?width=1280&height=720&fps=30`
//!
//! appsrc 以阻塞模式工作，编码器处理不过来时 `write_frame` 会等待，
//! 内存中只保留少量待编码的帧。

use std::path::{Path, PathBuf};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{FrameSink, SinkError, query_param},
};

/// 等待编码器写完文件的最长时间
const EOS_TIMEOUT_SECS: u64 = 30;

/// GStreamer 视频输出错误类型
#[derive(Error, Debug)]
pub enum GStreamerVideoSinkError {
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsrc 元素
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  /// 视频尺寸无效
  #[error("Invalid video size {0}x{1}")]
  InvalidSize(u32, u32),
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 推送缓冲区失败
  #[error("Failed to push buffer: {0:?}")]
  FlowError(gst::FlowError),
}

/// GStreamer 视频文件输出
pub struct GStreamerVideoSink {
  path: PathBuf,
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  video_info: gst_video::VideoInfo,
  fps: f64,
  frames_written: u64,
  finished: bool,
}

fn encoder_for(path: &Path) -> &'static str {
  let extension = path
    .extension()
    .and_then(|e| e.to_str())
    .map(str::to_ascii_lowercase);
  match extension.as_deref() {
    Some("mkv") => "videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! matroskamux",
    Some("avi") => "videoconvert ! video/x-raw,format=I420 ! x264enc ! avimux",
    Some("webm") => "videoconvert ! vp8enc ! webmmux",
    _ => "videoconvert ! video/x-raw,format=I420 ! x264enc speed-preset=fast ! h264parse ! mp4mux",
  }
}

impl GStreamerVideoSink {
  pub fn create(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, SinkError> {
    if width == 0 || height == 0 {
      return Err(GStreamerVideoSinkError::InvalidSize(width, height).into());
    }
    gst::init().map_err(GStreamerVideoSinkError::from)?;

    let pipeline_desc = format!(
      "appsrc name=src ! {} ! filesink name=file",
      encoder_for(path)
    );
    info!("Creating video output pipeline: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)
      .map_err(GStreamerVideoSinkError::from)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerVideoSinkError::PipelineError("Failed to create pipeline".to_string())
      })?;
    pipeline
      .by_name("file")
      .ok_or_else(|| GStreamerVideoSinkError::PipelineError("No filesink".to_string()))?
      .set_property("location", path.display().to_string().as_str());

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoSinkError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoSinkError::AppSrcNotFound)?;

    let framerate = gst::Fraction::new((fps * 1000.0).round() as i32, 1000);
    let video_info = gst_video::VideoInfo::builder(gst_video::VideoFormat::Rgb, width, height)
      .fps(framerate)
      .build()
      .map_err(GStreamerVideoSinkError::from)?;
    let caps = video_info.to_caps().map_err(GStreamerVideoSinkError::from)?;

    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);
    appsrc.set_block(true);
    appsrc.set_max_bytes(video_info.size() as u64 * 4);

    pipeline
      .set_state(gst::State::Playing)
      .map_err(GStreamerVideoSinkError::from)?;

    info!(
      "Video output initialized: {}x{} @ {} fps -> {}",
      width,
      height,
      fps,
      path.display()
    );

    Ok(Self {
      path: path.to_path_buf(),
      pipeline,
      appsrc,
      video_info,
      fps,
      frames_written: 0,
      finished: false,
    })
  }

  /// 按 GStreamer 的行对齐要求拷贝到新的缓冲区
  fn to_buffer(&self, frame: &RgbImage) -> Result<gst::Buffer, GStreamerVideoSinkError> {
    let stride = self.video_info.stride()[0] as usize;
    let row = self.video_info.width() as usize * 3;
    let mut data = vec![0u8; self.video_info.size()];
    for (y, line) in frame.as_raw().chunks_exact(row).enumerate() {
      data[y * stride..y * stride + row].copy_from_slice(line);
    }

    let mut buffer = gst::Buffer::from_mut_slice(data);
    let frame_ns = 1e9 / self.fps;
    let buffer_ref = buffer
      .get_mut()
      .ok_or_else(|| GStreamerVideoSinkError::PipelineError("Buffer is shared".to_string()))?;
    buffer_ref.set_pts(gst::ClockTime::from_nseconds(
      (self.frames_written as f64 * frame_ns) as u64,
    ));
    buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_ns as u64));
    Ok(buffer)
  }

  fn wait_for_eos(&self) -> Result<(), GStreamerVideoSinkError> {
    let Some(bus) = self.pipeline.bus() else {
      return Ok(());
    };
    let message = bus.timed_pop_filtered(
      gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS),
      &[gst::MessageType::Eos, gst::MessageType::Error],
    );
    match message.as_ref().map(|m| m.view()) {
      Some(gst::MessageView::Eos(_)) => Ok(()),
      Some(gst::MessageView::Error(err)) => Err(GStreamerVideoSinkError::PipelineError(format!(
        "{} ({:?})",
        err.error(),
        err.debug()
      ))),
      _ => Err(GStreamerVideoSinkError::PipelineError(
        "Timed out waiting for end of stream".to_string(),
      )),
    }
  }
}

impl FromUrlWithScheme for GStreamerVideoSink {
  const SCHEME: &'static str = "gstvideo";
}

impl FromUrl for GStreamerVideoSink {
  type Error = SinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SinkError::SchemeMismatch);
    }
    let width = query_param(url, "width")?.unwrap_or(640);
    let height = query_param(url, "height")?.unwrap_or(480);
    let fps = query_param(url, "fps")?.unwrap_or(30.0);
    Self::create(Path::new(url.path()), width, height, fps)
  }
}

impl FrameSink for GStreamerVideoSink {
  fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
    if self.finished {
      return Err(SinkError::Finished);
    }
    let expected = (self.video_info.width(), self.video_info.height());
    if frame.dimensions() != expected {
      return Err(SinkError::FrameSizeMismatch {
        expected,
        actual: frame.dimensions(),
      });
    }
    let buffer = self.to_buffer(frame)?;
    self
      .appsrc
      .push_buffer(buffer)
      .map_err(GStreamerVideoSinkError::FlowError)?;
    self.frames_written += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), SinkError> {
    if self.finished {
      return Ok(());
    }
    self.finished = true;
    let result = self
      .appsrc
      .end_of_stream()
      .map_err(GStreamerVideoSinkError::FlowError)
      .and_then(|_| self.wait_for_eos());
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer video output pipeline: {}", e);
    }
    info!(
      "Video output closed. Total frames written: {}",
      self.frames_written
    );
    result.map_err(SinkError::from)
  }

  fn frames_written(&self) -> u64 {
    self.frames_written
  }

  fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for GStreamerVideoSink {
  fn drop(&mut self) {
    if let Err(e) = self.finish() {
      warn!("Failed to finalize {}: {}", self.path.display(), e);
    }
  }
}
