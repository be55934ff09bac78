// 该文件是 Posekit 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 视频文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频文件输入
//!
//! 通过 `filesrc ! decodebin ! videoconvert` 解码任意 GStreamer 支持的容器，
//! 输出 RGB 帧。appsink 不丢帧，解码速度跟随处理速度。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! ## 基本用法
//!
//! ```no_run
//! use posekit::{FromUrl, input::{FrameSource, GStreamerSource}};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("gst:///data/squat.mp4")?;
//! let source = GStreamerSource::from_url(&url)?;
//! println!("{:?}", source.video_info());
//! for frame in source {
//!     let frame = frame?;
//!     println!("{}x{}", frame.width(), frame.height());
//! }
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{FrameSource, SourceError, normalize_fps},
  pose::VideoInfo,
};

/// 等待管道进入 PAUSED 的最长时间
const STATE_TIMEOUT_SECS: u64 = 10;
/// 等待下一帧的最长时间
const PULL_TIMEOUT_SECS: u64 = 10;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerSourceError {
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 无法获取管道中的元素
  #[error("Failed to get element {0}")]
  ElementNotFound(&'static str),
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format")]
  UnsupportedFormat,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 等待帧超时
  #[error("Timed out waiting for frame {0}")]
  Timeout(u64),
}

/// GStreamer 视频文件输入
pub struct GStreamerSource {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  info: VideoInfo,
  stem: String,
  index: u64,
  finished: bool,
}

impl GStreamerSource {
  pub fn open(path: &Path) -> Result<Self, SourceError> {
    gst::init().map_err(GStreamerSourceError::from)?;
    let location = path.display().to_string();

    let description = "filesrc name=src ! decodebin ! videoconvert ! video/x-raw,format=RGB \
                       ! appsink name=sink sync=false max-buffers=4";
    info!("GStreamer pipeline description: {}", description);

    let pipeline = gst::parse::launch(description)
      .map_err(GStreamerSourceError::from)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerSourceError::PipelineError("Failed to create pipeline".to_string()))?;
    pipeline
      .by_name("src")
      .ok_or(GStreamerSourceError::ElementNotFound("filesrc"))?
      .set_property("location", location.as_str());
    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerSourceError::ElementNotFound("appsink"))?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerSourceError::ElementNotFound("appsink"))?;

    let info = match preroll(&pipeline, &appsink, &location) {
      Ok(info) => info,
      Err(e) => {
        error!("Failed to open {}: {}", location, e);
        let _ = pipeline.set_state(gst::State::Null);
        return Err(e.into());
      }
    };
    info!(
      "Opened {}: {}x{}, {} fps, {} frames",
      location, info.width, info.height, info.fps, info.total_frames
    );

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
      error!("Failed to start {}: {}", location, e);
      let _ = pipeline.set_state(gst::State::Null);
      return Err(GStreamerSourceError::from(e).into());
    }

    Ok(Self {
      pipeline,
      appsink,
      finished: info.total_frames == 0 && info.width == 0,
      info,
      stem: path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string()),
      index: 0,
    })
  }
}

/// 让管道进入 PAUSED 并从预卷帧读取分辨率与帧率
fn preroll(
  pipeline: &gst::Pipeline,
  appsink: &gst_app::AppSink,
  location: &str,
) -> Result<VideoInfo, GStreamerSourceError> {
  pipeline.set_state(gst::State::Paused)?;
  let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(STATE_TIMEOUT_SECS));
  if let Err(e) = result {
    let message = bus_error(pipeline).unwrap_or_else(|| e.to_string());
    return Err(GStreamerSourceError::PipelineError(message));
  }

  let sample = match appsink.pull_preroll() {
    Ok(sample) => sample,
    Err(_) if appsink.is_eos() => {
      warn!("{} contains no video frames", location);
      return Ok(VideoInfo {
        path: location.to_string(),
        width: 0,
        height: 0,
        fps: normalize_fps(0.0, location),
        total_frames: 0,
      });
    }
    Err(e) => {
      let message = bus_error(pipeline).unwrap_or_else(|| e.to_string());
      return Err(GStreamerSourceError::PipelineError(message));
    }
  };

  let caps = sample.caps().ok_or(GStreamerSourceError::VideoInfoError)?;
  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerSourceError::VideoInfoError)?;
  let rate = video_info.fps();
  let fps = if rate.denom() != 0 {
    rate.numer() as f64 / rate.denom() as f64
  } else {
    0.0
  };
  let fps = normalize_fps(fps, location);

  let total_frames = pipeline
    .query_duration::<gst::ClockTime>()
    .map(|d| (d.nseconds() as f64 / 1e9 * fps).round() as u64)
    .unwrap_or(0);

  Ok(VideoInfo {
    path: location.to_string(),
    width: video_info.width(),
    height: video_info.height(),
    fps,
    total_frames,
  })
}

fn bus_error(pipeline: &gst::Pipeline) -> Option<String> {
  let bus = pipeline.bus()?;
  let message = bus.pop_filtered(&[gst::MessageType::Error])?;
  match message.view() {
    gst::MessageView::Error(err) => Some(format!("{} ({:?})", err.error(), err.debug())),
    _ => None,
  }
}

/// 按 stride 逐行拷贝 RGB 数据
fn sample_to_image(sample: &gst::Sample) -> Result<RgbImage, GStreamerSourceError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerSourceError::PipelineError("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerSourceError::PipelineError("No caps in sample".to_string()))?;
  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerSourceError::VideoInfoError)?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(GStreamerSourceError::UnsupportedFormat);
  }

  let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &video_info)?;
  let stride = frame.plane_stride()[0] as usize;
  let data = frame.plane_data(0)?;

  let (width, height) = (video_info.width(), video_info.height());
  let row = width as usize * 3;
  let mut pixels = Vec::with_capacity(row * height as usize);
  for y in 0..height as usize {
    let start = y * stride;
    let line = data
      .get(start..start + row)
      .ok_or(GStreamerSourceError::BufferSizeMismatch {
        expected: (height as usize - 1) * stride + row,
        actual: data.len(),
      })?;
    pixels.extend_from_slice(line);
  }

  RgbImage::from_raw(width, height, pixels).ok_or(GStreamerSourceError::BufferSizeMismatch {
    expected: row * height as usize,
    actual: 0,
  })
}

impl FromUrlWithScheme for GStreamerSource {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerSource {
  type Error = SourceError;

  /// 支持 `gst:///path/video.mp4` 与 `gst://file/path/video.mp4`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SourceError::SchemeMismatch);
    }
    match url.host_str() {
      None | Some("") | Some("file") => Self::open(Path::new(url.path())),
      Some(host) => Err(SourceError::Unsupported(format!("gst://{}", host))),
    }
  }
}

impl Iterator for GStreamerSource {
  type Item = Result<RgbImage, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    let index = self.index;
    let Some(sample) = self
      .appsink
      .try_pull_sample(gst::ClockTime::from_seconds(PULL_TIMEOUT_SECS))
    else {
      self.finished = true;
      if self.appsink.is_eos() {
        debug!("End of stream after {} frames", index);
        return None;
      }
      let err = match bus_error(&self.pipeline) {
        Some(message) => GStreamerSourceError::PipelineError(message),
        None => GStreamerSourceError::Timeout(index),
      };
      error!("Failed to fetch frame {}: {}", index, err);
      return Some(Err(err.into()));
    };

    self.index += 1;
    let result = sample_to_image(&sample).map_err(SourceError::from);
    if let Err(e) = &result {
      error!("Failed to convert frame {}: {}", index, e);
      self.finished = true;
    }
    Some(result)
  }
}

impl FrameSource for GStreamerSource {
  fn video_info(&self) -> &VideoInfo {
    &self.info
  }

  fn stem(&self) -> &str {
    &self.stem
  }

  fn close(&mut self) {
    self.finished = true;
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl Drop for GStreamerSource {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn non_video_file_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.mp4");
    std::fs::write(&path, b"plain text, not a container").unwrap();
    assert!(GStreamerSource::open(&path).is_err());
    // 失败后管道已释放，同一文件可以再次尝试打开
    assert!(GStreamerSource::open(&path).is_err());
  }

  #[test]
  fn rejects_remote_hosts() {
    let url = Url::parse("gst://camera.local/stream").unwrap();
    assert!(matches!(
      GStreamerSource::from_url(&url),
      Err(SourceError::Unsupported(_))
    ));
  }
}
