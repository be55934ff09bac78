// 该文件是 Posekit 项目的一部分。
// src/input/synthetic.rs - 合成视频输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use image::{Rgb, RgbImage};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{DEFAULT_FPS, FrameSource, SourceError, normalize_fps, query_param},
  pose::VideoInfo,
};

const SYNTHETIC_STEM: &str = "synthetic";

/// 在内存中生成固定数量的渐变帧，不需要任何文件或解码器
///
/// 例如 `synthetic://?width=64&height=48&frames=10&fps=30`。
/// `fail_at` 参数让第 N 帧（从 0 开始）解码失败，用来模拟损坏的视频。
pub struct SyntheticSource {
  info: VideoInfo,
  next: u64,
  fail_at: Option<u64>,
  finished: bool,
}

impl SyntheticSource {
  pub fn new(width: u32, height: u32, frames: u64) -> Self {
    Self {
      info: VideoInfo {
        path: format!("{}://?width={}&height={}&frames={}", Self::SCHEME, width, height, frames),
        width,
        height,
        fps: DEFAULT_FPS,
        total_frames: frames,
      },
      next: 0,
      fail_at: None,
      finished: false,
    }
  }

  pub fn with_fps(mut self, fps: f64) -> Self {
    self.info.fps = normalize_fps(fps, &self.info.path);
    self
  }

  pub fn with_failure_at(mut self, frame: u64) -> Self {
    self.fail_at = Some(frame);
    self
  }

  fn render(&self, index: u64) -> RgbImage {
    let (width, height) = (self.info.width, self.info.height);
    let shift = (index * 8 % 256) as u8;
    RgbImage::from_fn(width, height, |x, y| {
      let r = (x * 255 / width.max(1)) as u8;
      let g = (y * 255 / height.max(1)) as u8;
      Rgb([r.wrapping_add(shift), g, shift])
    })
  }
}

impl FromUrlWithScheme for SyntheticSource {
  const SCHEME: &'static str = "synthetic";
}

impl FromUrl for SyntheticSource {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SourceError::SchemeMismatch);
    }
    let width = query_param(url, "width")?.unwrap_or(64);
    let height = query_param(url, "height")?.unwrap_or(48);
    let frames = query_param(url, "frames")?.unwrap_or(10);
    let fps = query_param(url, "fps")?.unwrap_or(DEFAULT_FPS);

    let mut source = Self::new(width, height, frames).with_fps(fps);
    if let Some(frame) = query_param(url, "fail_at")? {
      source = source.with_failure_at(frame);
    }
    source.info.path = url.to_string();
    info!(
      "合成视频: {}x{}, {} 帧, {} fps",
      width, height, frames, source.info.fps
    );
    Ok(source)
  }
}

impl Iterator for SyntheticSource {
  type Item = Result<RgbImage, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished || self.next >= self.info.total_frames {
      return None;
    }
    let index = self.next;
    self.next += 1;
    if self.fail_at == Some(index) {
      self.finished = true;
      return Some(Err(SourceError::CorruptFrame(index)));
    }
    Some(Ok(self.render(index)))
  }
}

impl FrameSource for SyntheticSource {
  fn video_info(&self) -> &VideoInfo {
    &self.info
  }

  fn stem(&self) -> &str {
    SYNTHETIC_STEM
  }

  fn close(&mut self) {
    if !self.finished {
      debug!("关闭合成视频, 已产生 {} 帧", self.next);
    }
    self.finished = true;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yields_declared_number_of_frames() {
    let source = SyntheticSource::new(16, 8, 5);
    let frames: Vec<_> = source.collect::<Result<_, _>>().unwrap();
    assert_eq!(frames.len(), 5);
    assert!(frames.iter().all(|f| f.dimensions() == (16, 8)));
    assert_ne!(frames[0], frames[1]);
  }

  #[test]
  fn failure_stops_the_stream() {
    let mut source = SyntheticSource::new(4, 4, 5).with_failure_at(2);
    assert!(source.next().unwrap().is_ok());
    assert!(source.next().unwrap().is_ok());
    assert!(matches!(
      source.next(),
      Some(Err(SourceError::CorruptFrame(2)))
    ));
    assert!(source.next().is_none());
  }

  #[test]
  fn parses_url_parameters() {
    let url = Url::parse("synthetic://?width=20&height=10&frames=0&fps=0").unwrap();
    let mut source = SyntheticSource::from_url(&url).unwrap();
    assert_eq!(source.video_info().fps, DEFAULT_FPS);
    assert_eq!(source.video_info().total_frames, 0);
    assert!(source.next().is_none());

    let url = Url::parse("synthetic://?width=wide").unwrap();
    assert!(matches!(
      SyntheticSource::from_url(&url),
      Err(SourceError::InvalidParameter { .. })
    ));
  }
}
