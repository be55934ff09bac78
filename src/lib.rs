// 该文件是 Posekit 项目的一部分。
// src/lib.rs - 库主文件
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

pub mod input;
pub mod model;
pub mod output;
pub mod pose;
pub mod registry;
pub mod stats;
pub mod task;

use crate::model::ModelOptions;
use crate::pose::Report;
use crate::registry::{EstimatorRegistry, ModelDescriptor};
use crate::task::{FrameProcessor, ProcessError, ProcessFlags, ProgressCallback};

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}

/// 注册表中的模型，按注册顺序
pub fn list_models(registry: &EstimatorRegistry) -> Vec<ModelDescriptor> {
  registry.list()
}

/// 处理一个视频并返回报告
///
/// `progress` 在每帧处理完后以 `(frame_number, total_frames)` 调用。
pub fn process_video(
  registry: &EstimatorRegistry,
  path: &str,
  model_id: &str,
  options: &ModelOptions,
  output_dir: &Path,
  flags: ProcessFlags,
  progress: Option<ProgressCallback<'_>>,
) -> Result<Report, ProcessError> {
  let mut processor = FrameProcessor::new(registry, model_id)
    .with_options(options.clone())
    .with_output_dir(output_dir)
    .with_flags(flags);
  if let Some(progress) = progress {
    processor = processor.with_progress(progress);
  }
  processor.process(path)
}
