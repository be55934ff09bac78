// 该文件是 Posekit 项目的一部分。
// src/output/directory_record.rs - 图像序列输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::{Path, PathBuf};

use image::RgbImage;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{FrameSink, SinkError, query_param},
};

/// 把标注帧逐张写成 `frame_000000.png` 形式的图片
///
/// 例如 `frames:///tmp/annotated_clip?width=640&height=480`。
/// 宽高为 0 时以第一帧的尺寸为准。
pub struct ImageSequenceSink {
  directory: PathBuf,
  size: Option<(u32, u32)>,
  frames_written: u64,
  finished: bool,
}

impl ImageSequenceSink {
  pub fn create(directory: &Path, width: u32, height: u32) -> Result<Self, SinkError> {
    std::fs::create_dir_all(directory)?;
    info!("图像序列输出目录: {}", directory.display());
    Ok(Self {
      directory: directory.to_path_buf(),
      size: (width > 0 && height > 0).then_some((width, height)),
      frames_written: 0,
      finished: false,
    })
  }

  fn frame_path(&self) -> PathBuf {
    self
      .directory
      .join(format!("frame_{:06}.png", self.frames_written))
  }
}

impl FromUrlWithScheme for ImageSequenceSink {
  const SCHEME: &'static str = "frames";
}

impl FromUrl for ImageSequenceSink {
  type Error = SinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SinkError::SchemeMismatch);
    }
    let width = query_param(url, "width")?.unwrap_or(0);
    let height = query_param(url, "height")?.unwrap_or(0);
    Self::create(Path::new(url.path()), width, height)
  }
}

impl FrameSink for ImageSequenceSink {
  fn write_frame(&mut self, frame: &RgbImage) -> Result<(), SinkError> {
    if self.finished {
      return Err(SinkError::Finished);
    }
    let actual = frame.dimensions();
    let expected = *self.size.get_or_insert(actual);
    if actual != expected {
      return Err(SinkError::FrameSizeMismatch { expected, actual });
    }
    frame.save(self.frame_path())?;
    self.frames_written += 1;
    Ok(())
  }

  fn finish(&mut self) -> Result<(), SinkError> {
    if !self.finished {
      self.finished = true;
      debug!(
        "图像序列输出完成: {}, 共 {} 帧",
        self.directory.display(),
        self.frames_written
      );
    }
    Ok(())
  }

  fn frames_written(&self) -> u64 {
    self.frames_written
  }

  fn path(&self) -> &Path {
    &self.directory
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn writes_numbered_frames() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("annotated_clip");
    let mut sink = ImageSequenceSink::create(&target, 8, 6).unwrap();
    for _ in 0..3 {
      sink.write_frame(&RgbImage::new(8, 6)).unwrap();
    }
    sink.finish().unwrap();

    assert_eq!(sink.frames_written(), 3);
    assert!(target.join("frame_000000.png").is_file());
    assert!(target.join("frame_000002.png").is_file());
    assert!(matches!(
      sink.write_frame(&RgbImage::new(8, 6)),
      Err(SinkError::Finished)
    ));
  }

  #[test]
  fn rejects_frames_of_another_size() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("frames://{}/out", dir.path().display())).unwrap();
    let mut sink = ImageSequenceSink::from_url(&url).unwrap();
    sink.write_frame(&RgbImage::new(4, 4)).unwrap();
    assert!(matches!(
      sink.write_frame(&RgbImage::new(5, 4)),
      Err(SinkError::FrameSizeMismatch { .. })
    ));
  }
}
