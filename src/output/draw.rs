// 该文件是 Posekit 项目的一部分。
// src/output/draw.rs - 姿态检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
  draw_filled_circle_mut, draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut,
  draw_text_mut,
};
use imageproc::rect::Rect;
use thiserror::Error;

use crate::pose::{Keypoint, PoseData};

// 绘制常量
const LINE_THICKNESS: i32 = 2;
const POINT_RADIUS: i32 = 4;
const RING_RADIUS: i32 = 6;
const LABEL_FONT_SIZE: f32 = 12.0;
const BANNER_FONT_SIZE: f32 = 20.0;
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const GREY: Rgb<u8> = Rgb([128, 128, 128]);

const HEAD_COLOR: Rgb<u8> = Rgb([255, 0, 255]);
const ARM_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
const LEG_COLOR: Rgb<u8> = Rgb([0, 255, 255]);

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(String),
}

/// 连线颜色
#[derive(Debug, Clone, Copy)]
pub enum LineColoring {
  /// 按起点所属身体部位区分头部、手臂、腿部
  ByBodyPart,
  Uniform(Rgb<u8>),
}

/// 关键点颜色
#[derive(Debug, Clone, Copy)]
pub enum PointColoring {
  /// 高置信度绿色，中等黄色，较低红色
  ByConfidence,
  /// 按关键点名称区分面部、手臂、腿部
  ByRegion,
}

/// 骨架绘制器
#[derive(Clone)]
pub struct Draw {
  confidence_threshold: f64,
  line_coloring: LineColoring,
  point_coloring: PointColoring,
  draw_bbox: bool,
  font: Option<FontArc>,
  banner: Option<String>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.5,
      line_coloring: LineColoring::ByBodyPart,
      point_coloring: PointColoring::ByConfidence,
      draw_bbox: true,
      font: None,
      banner: None,
    }
  }
}

impl Draw {
  pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn with_line_coloring(mut self, coloring: LineColoring) -> Self {
    self.line_coloring = coloring;
    self
  }

  pub fn with_point_coloring(mut self, coloring: PointColoring) -> Self {
    self.point_coloring = coloring;
    self
  }

  pub fn with_bbox(mut self, draw_bbox: bool) -> Self {
    self.draw_bbox = draw_bbox;
    self
  }

  /// 左上角显示的文字，仅在加载了字体时绘制
  pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
    self.banner = Some(banner.into());
    self
  }

  /// 加载 TTF/OTF 字体，用于关键点名称与标题
  pub fn with_font_file(mut self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontArc::try_from_vec(data).map_err(|e| DrawError::InvalidFont(e.to_string()))?;
    self.font = Some(font);
    Ok(self)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 在帧的副本上绘制姿态
  pub fn draw_pose(
    &self,
    frame: &RgbImage,
    pose: &PoseData,
    connections: &[(usize, usize)],
  ) -> RgbImage {
    let mut image = frame.clone();
    let keypoints = &pose.keypoints;

    for &(start, end) in connections {
      let (Some(a), Some(b)) = (keypoints.get(start), keypoints.get(end)) else {
        continue;
      };
      if a.confidence > self.confidence_threshold && b.confidence > self.confidence_threshold {
        let color = self.line_color(start);
        draw_thick_line(&mut image, a, b, color);
      }
    }

    for kp in keypoints
      .iter()
      .filter(|kp| kp.confidence > self.confidence_threshold)
    {
      let center = (kp.pixel_x as i32, kp.pixel_y as i32);
      draw_filled_circle_mut(&mut image, center, POINT_RADIUS, self.point_color(kp));
      draw_hollow_circle_mut(&mut image, center, RING_RADIUS, WHITE);

      if let Some(font) = &self.font {
        draw_text_mut(
          &mut image,
          WHITE,
          center.0 + 10,
          center.1 - 10,
          PxScale::from(LABEL_FONT_SIZE),
          font,
          &kp.name,
        );
      }
    }

    if self.draw_bbox
      && let Some(bbox) = pose.bbox
      && bbox.width > 0
      && bbox.height > 0
    {
      let rect = Rect::at(bbox.x as i32, bbox.y as i32).of_size(bbox.width, bbox.height);
      draw_hollow_rect_mut(&mut image, rect, GREY);
    }

    if let (Some(font), Some(banner)) = (&self.font, &self.banner) {
      draw_text_mut(
        &mut image,
        WHITE,
        10,
        10,
        PxScale::from(BANNER_FONT_SIZE),
        font,
        banner,
      );
    }

    image
  }

  fn line_color(&self, start: usize) -> Rgb<u8> {
    match self.line_coloring {
      LineColoring::Uniform(color) => color,
      LineColoring::ByBodyPart => match start {
        0..=4 => HEAD_COLOR,
        5..=10 => ARM_COLOR,
        _ => LEG_COLOR,
      },
    }
  }

  fn point_color(&self, kp: &Keypoint) -> Rgb<u8> {
    match self.point_coloring {
      PointColoring::ByConfidence => {
        if kp.confidence > 0.8 {
          Rgb([0, 255, 0])
        } else if kp.confidence > 0.6 {
          Rgb([255, 255, 0])
        } else {
          Rgb([255, 0, 0])
        }
      }
      PointColoring::ByRegion => {
        let name = kp.name.as_str();
        if name.contains("eye") || name == "nose" {
          Rgb([0, 0, 255])
        } else if ["shoulder", "elbow", "wrist"].iter().any(|p| name.contains(p)) {
          Rgb([0, 255, 0])
        } else if ["hip", "knee", "ankle"].iter().any(|p| name.contains(p)) {
          Rgb([255, 0, 0])
        } else {
          Rgb([0, 255, 255])
        }
      }
    }
  }
}

fn draw_thick_line(image: &mut RgbImage, a: &Keypoint, b: &Keypoint, color: Rgb<u8>) {
  let (ax, ay) = (a.pixel_x as f32, a.pixel_y as f32);
  let (bx, by) = (b.pixel_x as f32, b.pixel_y as f32);
  for offset in 0..LINE_THICKNESS {
    let d = offset as f32 - (LINE_THICKNESS - 1) as f32 / 2.0;
    draw_line_segment_mut(image, (ax + d, ay), (bx + d, by), color);
    draw_line_segment_mut(image, (ax, ay + d), (bx, by + d), color);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pose::{BoundingBox, PoseMetadata};

  fn pose() -> PoseData {
    let keypoints = vec![
      Keypoint::from_normalized(0, "nose", 0.25, 0.5, 0.9, 40, 40),
      Keypoint::from_normalized(1, "left_eye", 0.75, 0.5, 0.9, 40, 40),
      Keypoint::from_normalized(2, "right_eye", 0.5, 0.9, 0.1, 40, 40),
    ];
    PoseData {
      bbox: BoundingBox::enclosing(&keypoints, 0.5),
      keypoints,
      metadata: PoseMetadata::new("test", 0.0),
    }
  }

  #[test]
  fn draws_on_copy_only() {
    let frame = RgbImage::new(40, 40);
    let drawn = Draw::default().draw_pose(&frame, &pose(), &[(0, 1), (0, 2)]);
    assert!(frame.pixels().all(|p| p.0 == [0, 0, 0]));
    assert_eq!(drawn.dimensions(), frame.dimensions());
    // 高置信度关键点中心被着色
    assert_eq!(drawn.get_pixel(10, 20).0, [0, 255, 0]);
    // 低置信度关键点不绘制
    assert_eq!(drawn.get_pixel(20, 36).0, [0, 0, 0]);
  }

  #[test]
  fn region_coloring_uses_names() {
    let frame = RgbImage::new(40, 40);
    let draw = Draw::default()
      .with_point_coloring(PointColoring::ByRegion)
      .with_line_coloring(LineColoring::Uniform(Rgb([0, 255, 0])))
      .with_bbox(false);
    let drawn = draw.draw_pose(&frame, &pose(), &[]);
    assert_eq!(drawn.get_pixel(10, 20).0, [0, 0, 255]);
  }

  #[test]
  fn missing_font_file_is_an_error() {
    let err = Draw::default().with_font_file("/nonexistent/font.ttf");
    assert!(matches!(err, Err(DrawError::IoError(_))));
  }
}
