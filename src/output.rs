// 该文件是 Posekit 项目的一部分。
// src/output.rs - 输出定义
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::FromUrl;
#[cfg(any(feature = "directory_record", feature = "gstreamer_output"))]
use crate::FromUrlWithScheme;

/// 标注视频的逐帧写出
///
/// 每次只持有一帧，写出之后即可释放。
pub trait FrameSink {
  fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError>;

  /// 写完所有帧后调用，重复调用无副作用
  fn finish(&mut self) -> Result<(), SinkError>;

  fn frames_written(&self) -> u64;

  /// 输出的文件或目录
  fn path(&self) -> &Path;
}

pub mod draw;
pub mod report;

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::ImageSequenceSink;

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerVideoSink, GStreamerVideoSinkError};

#[derive(Error, Debug)]
pub enum SinkError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("没有可用的视频输出")]
  Unsupported,
  #[error("输出参数无效: {key}={value}")]
  InvalidParameter { key: String, value: String },
  #[error("帧尺寸 {actual:?} 与输出尺寸 {expected:?} 不一致")]
  FrameSizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("输出已关闭")]
  Finished,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamer(#[from] GStreamerVideoSinkError),
}

pub(crate) fn query_param<T: std::str::FromStr>(
  url: &Url,
  key: &str,
) -> Result<Option<T>, SinkError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    None => Ok(None),
    Some((_, value)) => value
      .parse()
      .map(Some)
      .map_err(|_| SinkError::InvalidParameter {
        key: key.to_string(),
        value: value.into_owned(),
      }),
  }
}

pub enum SinkWrapper {
  #[cfg(feature = "directory_record")]
  ImageSequence(ImageSequenceSink),
  #[cfg(feature = "gstreamer_output")]
  GStreamerVideo(GStreamerVideoSink),
}

impl SinkWrapper {
  /// 在 `output_dir` 下为视频 `stem` 创建标注输出
  ///
  /// 启用 GStreamer 时写 `annotated_<stem>.mp4`，否则写图像序列目录 `annotated_<stem>/`。
  #[allow(unused_variables)]
  pub fn annotated(
    output_dir: &Path,
    stem: &str,
    width: u32,
    height: u32,
    fps: f64,
  ) -> Result<Self, SinkError> {
    #[cfg(feature = "gstreamer_output")]
    {
      let path = output_dir.join(format!("annotated_{}.mp4", stem));
      let sink = GStreamerVideoSink::create(&path, width, height, fps)?;
      return Ok(SinkWrapper::GStreamerVideo(sink));
    }
    #[cfg(all(feature = "directory_record", not(feature = "gstreamer_output")))]
    {
      let path = output_dir.join(format!("annotated_{}", stem));
      let sink = ImageSequenceSink::create(&path, width, height)?;
      return Ok(SinkWrapper::ImageSequence(sink));
    }
    #[cfg(not(any(feature = "directory_record", feature = "gstreamer_output")))]
    {
      return Err(SinkError::Unsupported);
    }
  }

  fn inner(&self) -> &dyn FrameSink {
    match *self {
      #[cfg(feature = "directory_record")]
      SinkWrapper::ImageSequence(ref sink) => sink,
      #[cfg(feature = "gstreamer_output")]
      SinkWrapper::GStreamerVideo(ref sink) => sink,
    }
  }

  fn inner_mut(&mut self) -> &mut dyn FrameSink {
    match *self {
      #[cfg(feature = "directory_record")]
      SinkWrapper::ImageSequence(ref mut sink) => sink,
      #[cfg(feature = "gstreamer_output")]
      SinkWrapper::GStreamerVideo(ref mut sink) => sink,
    }
  }
}

impl FromUrl for SinkWrapper {
  type Error = SinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      #[cfg(feature = "directory_record")]
      ImageSequenceSink::SCHEME => Ok(SinkWrapper::ImageSequence(ImageSequenceSink::from_url(
        url,
      )?)),
      #[cfg(feature = "gstreamer_output")]
      GStreamerVideoSink::SCHEME => Ok(SinkWrapper::GStreamerVideo(
        GStreamerVideoSink::from_url(url)?,
      )),
      _ => Err(SinkError::SchemeMismatch),
    }
  }
}

impl FrameSink for SinkWrapper {
  fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
    self.inner_mut().write_frame(frame)
  }

  fn finish(&mut self) -> Result<(), SinkError> {
    self.inner_mut().finish()
  }

  fn frames_written(&self) -> u64 {
    self.inner().frames_written()
  }

  fn path(&self) -> &Path {
    self.inner().path()
  }
}
