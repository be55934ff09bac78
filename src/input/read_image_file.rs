// 该文件是 Posekit 项目的一部分。
// src/input/read_image_file.rs - 图像序列输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{DEFAULT_FPS, FrameSource, SourceError, normalize_fps, query_param},
  pose::VideoInfo,
};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

/// 把目录里的图片按文件名排序后当作视频帧
///
/// 例如 `frames:///data/clip01?fps=25`。目录名即视频名，
/// 第一张图片在打开时解码以确定分辨率，其余图片按需解码。
pub struct ImageSequenceSource {
  info: VideoInfo,
  stem: String,
  pending: VecDeque<PathBuf>,
  first: Option<RgbImage>,
  finished: bool,
}

impl ImageSequenceSource {
  pub fn open(directory: &Path, fps: Option<f64>) -> Result<Self, SourceError> {
    let location = directory.display().to_string();
    if !directory.is_dir() {
      error!("图像序列目录不存在: {}", location);
      return Err(SourceError::NotFound(location));
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(directory)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| path.is_file() && is_image(path))
      .collect();
    files.sort();
    let mut pending: VecDeque<PathBuf> = files.into();

    let first = match pending.pop_front() {
      Some(path) => Some(decode(&path)?),
      None => None,
    };
    let (width, height) = first.as_ref().map(RgbImage::dimensions).unwrap_or((0, 0));
    let total_frames = pending.len() as u64 + first.is_some() as u64;

    let info = VideoInfo {
      path: location.clone(),
      width,
      height,
      fps: normalize_fps(fps.unwrap_or(DEFAULT_FPS), &location),
      total_frames,
    };
    info!(
      "打开图像序列 {}: {}x{}, {} 帧, {} fps",
      location, width, height, total_frames, info.fps
    );

    Ok(Self {
      info,
      stem: directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frames".to_string()),
      pending,
      first,
      finished: false,
    })
  }
}

fn is_image(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn decode(path: &Path) -> Result<RgbImage, SourceError> {
  let to_error = |source| SourceError::Decode {
    path: path.display().to_string(),
    source,
  };
  let image = ImageReader::open(path)?
    .with_guessed_format()?
    .decode()
    .map_err(to_error)?;
  Ok(image.into_rgb8())
}

impl FromUrlWithScheme for ImageSequenceSource {
  const SCHEME: &'static str = "frames";
}

impl FromUrl for ImageSequenceSource {
  type Error = SourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SourceError::SchemeMismatch);
    }
    let fps = query_param(url, "fps")?;
    Self::open(Path::new(url.path()), fps)
  }
}

impl Iterator for ImageSequenceSource {
  type Item = Result<RgbImage, SourceError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    if let Some(first) = self.first.take() {
      return Some(Ok(first));
    }
    let path = self.pending.pop_front()?;
    let result = decode(&path).and_then(|image| {
      let expected = (self.info.width, self.info.height);
      if image.dimensions() != expected {
        return Err(SourceError::FrameSizeMismatch {
          expected,
          actual: image.dimensions(),
        });
      }
      Ok(image)
    });
    if let Err(e) = &result {
      error!("解码 {} 失败: {}", path.display(), e);
      self.finished = true;
    }
    Some(result)
  }
}

impl FrameSource for ImageSequenceSource {
  fn video_info(&self) -> &VideoInfo {
    &self.info
  }

  fn stem(&self) -> &str {
    &self.stem
  }

  fn close(&mut self) {
    if !self.finished {
      debug!("关闭图像序列 {}", self.info.path);
      self.finished = true;
      self.first = None;
      self.pending.clear();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_frames(dir: &Path, count: u32) {
    for i in 0..count {
      let image = RgbImage::from_pixel(12, 8, image::Rgb([i as u8 * 10, 0, 0]));
      image.save(dir.join(format!("frame_{:03}.png", i))).unwrap();
    }
  }

  #[test]
  fn reads_frames_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 3);
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let source = ImageSequenceSource::open(dir.path(), Some(12.0)).unwrap();
    let info = source.video_info().clone();
    assert_eq!((info.width, info.height, info.total_frames), (12, 8, 3));
    assert_eq!(info.fps, 12.0);

    let frames: Vec<_> = source.collect::<Result<_, _>>().unwrap();
    let reds: Vec<u8> = frames.iter().map(|f| f.get_pixel(0, 0)[0]).collect();
    assert_eq!(reds, vec![0, 10, 20]);
  }

  #[test]
  fn missing_directory_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("gone");
    match ImageSequenceSource::open(&missing, None) {
      Err(SourceError::NotFound(location)) => assert_eq!(location, missing.display().to_string()),
      other => panic!("unexpected: {:?}", other.map(|s| s.video_info().clone())),
    }
  }

  #[test]
  fn video_info_records_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 1);
    let source = ImageSequenceSource::open(dir.path(), None).unwrap();
    assert_eq!(source.video_info().path, dir.path().display().to_string());
  }

  #[test]
  fn empty_directory_has_no_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = ImageSequenceSource::open(dir.path(), None).unwrap();
    assert_eq!(source.video_info().total_frames, 0);
    assert_eq!(source.video_info().fps, DEFAULT_FPS);
    assert!(source.next().is_none());
  }

  #[test]
  fn corrupt_frame_ends_stream_with_error() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 2);
    std::fs::write(dir.path().join("frame_001.png"), b"not a png").unwrap();

    let mut source = ImageSequenceSource::open(dir.path(), None).unwrap();
    assert!(source.next().unwrap().is_ok());
    assert!(matches!(source.next(), Some(Err(SourceError::Decode { .. }))));
    assert!(source.next().is_none());
  }

  #[test]
  fn from_url_reads_fps() {
    let dir = tempfile::tempdir().unwrap();
    write_frames(dir.path(), 1);
    let url = Url::from_directory_path(dir.path()).unwrap();
    let url = Url::parse(&format!("frames://{}?fps=25", url.path())).unwrap();
    let source = ImageSequenceSource::from_url(&url).unwrap();
    assert_eq!(source.video_info().fps, 25.0);
  }
}
