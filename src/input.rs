// 该文件是 Posekit 项目的一部分。
// src/input.rs - 视频输入
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

use std::path::Path;

use image::RgbImage;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, pose::VideoInfo};

/// 帧率未知时使用的帧率
pub const DEFAULT_FPS: f64 = 30.0;

/// 按顺序解码的视频帧
///
/// 迭代器在视频结束时返回 `None`，解码失败时返回 `Some(Err(..))`，
/// 此后不再产生任何帧。
pub trait FrameSource: Iterator<Item = Result<RgbImage, SourceError>> {
  /// 打开时得到的视频属性
  fn video_info(&self) -> &VideoInfo;

  /// 输出文件命名用的名字，通常是文件名去掉扩展名
  fn stem(&self) -> &str;

  /// 释放解码资源，重复调用无副作用
  fn close(&mut self) {}
}

mod synthetic;
pub use self::synthetic::SyntheticSource;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::ImageSequenceSource;

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{GStreamerSource, GStreamerSourceError};

#[derive(Error, Debug)]
pub enum SourceError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Unsupported video source: {0}")]
  Unsupported(String),
  #[error("Video source not found: {0}")]
  NotFound(String),
  #[error("Invalid source parameter {key}={value}")]
  InvalidParameter { key: String, value: String },
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Failed to decode {path}: {source}")]
  Decode {
    path: String,
    #[source]
    source: image::ImageError,
  },
  #[error("Frame size changed from {expected:?} to {actual:?}")]
  FrameSizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("Corrupt frame {0}")]
  CorruptFrame(u64),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamer(#[from] GStreamerSourceError),
}

/// 帧率为 0 或无法确定时退回到 [`DEFAULT_FPS`]
pub(crate) fn normalize_fps(fps: f64, path: &str) -> f64 {
  if fps.is_finite() && fps > 0.0 {
    fps
  } else {
    warn!("{} 的帧率未知, 使用默认值 {}", path, DEFAULT_FPS);
    DEFAULT_FPS
  }
}

/// 读取 URL 查询参数并解析
pub(crate) fn query_param<T: std::str::FromStr>(
  url: &Url,
  key: &str,
) -> Result<Option<T>, SourceError> {
  match url.query_pairs().find(|(k, _)| k == key) {
    None => Ok(None),
    Some((_, value)) => value
      .parse()
      .map(Some)
      .map_err(|_| SourceError::InvalidParameter {
        key: key.to_string(),
        value: value.into_owned(),
      }),
  }
}

/// 本 crate 支持的全部视频输入
pub enum SourceWrapper {
  Synthetic(SyntheticSource),
  #[cfg(feature = "read_image_file")]
  ImageSequence(ImageSequenceSource),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerSource),
}

impl SourceWrapper {
  /// 打开视频
  ///
  /// `location` 可以是带已知 scheme 的 URL，也可以是本地路径：
  /// 目录按图像序列读取，其他文件交给 GStreamer 解码。
  pub fn open(location: &str) -> Result<Self, SourceError> {
    if let Ok(url) = Url::parse(location)
      && Self::knows_scheme(url.scheme())
    {
      return Self::from_url(&url);
    }

    let path = Path::new(location);
    if !path.exists() {
      return Err(SourceError::NotFound(location.to_string()));
    }
    #[cfg(feature = "read_image_file")]
    {
      if path.is_dir() {
        let source = ImageSequenceSource::open(path, None)?;
        return Ok(SourceWrapper::ImageSequence(source));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      if path.is_file() {
        return Ok(SourceWrapper::GStreamer(GStreamerSource::open(path)?));
      }
    }
    Err(SourceError::Unsupported(location.to_string()))
  }

  fn knows_scheme(scheme: &str) -> bool {
    #[allow(unused_mut)]
    let mut schemes = vec![SyntheticSource::SCHEME];
    #[cfg(feature = "read_image_file")]
    schemes.push(ImageSequenceSource::SCHEME);
    #[cfg(feature = "gstreamer_input")]
    schemes.push(GStreamerSource::SCHEME);
    schemes.contains(&scheme)
  }

  fn inner(&self) -> &dyn FrameSource {
    match self {
      SourceWrapper::Synthetic(source) => source,
      #[cfg(feature = "read_image_file")]
      SourceWrapper::ImageSequence(source) => source,
      #[cfg(feature = "gstreamer_input")]
      SourceWrapper::GStreamer(source) => source,
    }
  }

  fn inner_mut(&mut self) -> &mut dyn FrameSource {
    match self {
      SourceWrapper::Synthetic(source) => source,
      #[cfg(feature = "read_image_file")]
      SourceWrapper::ImageSequence(source) => source,
      #[cfg(feature = "gstreamer_input")]
      SourceWrapper::GStreamer(source) => source,
    }
  }
}

impl FromUrl for SourceWrapper {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SyntheticSource::SCHEME => Ok(SourceWrapper::Synthetic(SyntheticSource::from_url(url)?)),
      #[cfg(feature = "read_image_file")]
      ImageSequenceSource::SCHEME => Ok(SourceWrapper::ImageSequence(
        ImageSequenceSource::from_url(url)?,
      )),
      #[cfg(feature = "gstreamer_input")]
      GStreamerSource::SCHEME => Ok(SourceWrapper::GStreamer(GStreamerSource::from_url(url)?)),
      _ => Err(SourceError::SchemeMismatch),
    }
  }
}

impl Iterator for SourceWrapper {
  type Item = Result<RgbImage, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.inner_mut().next()
  }
}

impl FrameSource for SourceWrapper {
  fn video_info(&self) -> &VideoInfo {
    self.inner().video_info()
  }

  fn stem(&self) -> &str {
    self.inner().stem()
  }

  fn close(&mut self) {
    self.inner_mut().close()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn opens_synthetic_url() {
    let source = SourceWrapper::open("synthetic://?width=32&height=24&frames=3&fps=10").unwrap();
    let info = source.video_info().clone();
    assert_eq!((info.width, info.height), (32, 24));
    assert_eq!(info.total_frames, 3);
    assert_eq!(info.fps, 10.0);
    assert_eq!(source.count(), 3);
  }

  #[test]
  fn missing_path_is_not_found() {
    assert!(matches!(
      SourceWrapper::open("/nonexistent/clip.mp4"),
      Err(SourceError::NotFound(_))
    ));
  }

  #[test]
  fn unknown_fps_falls_back() {
    assert_eq!(normalize_fps(0.0, "x"), DEFAULT_FPS);
    assert_eq!(normalize_fps(f64::NAN, "x"), DEFAULT_FPS);
    assert_eq!(normalize_fps(25.0, "x"), 25.0);
  }
}
