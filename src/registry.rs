// 该文件是 Posekit 项目的一部分。
// src/registry.rs - 模型注册表
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

//! 模型标识到构造函数的映射。
//!
//! 注册表是一个普通的值，由调用方创建后传给处理器，
//! 不同的注册表之间互不影响。

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{
  COCO_KEYPOINTS, COCO_SKELETON, Estimator, EstimatorError, ModelOptions, StubEstimator,
};

pub type Constructor = fn(&ModelOptions) -> Result<Estimator, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("未知模型: {name}, 可用模型: {}", available.join(", "))]
  UnknownModel { name: String, available: Vec<String> },
  #[error("模型 {0} 已注册")]
  DuplicateModel(String),
  #[error("模型参数无效: {0}")]
  InvalidOption(String),
  #[error("模型初始化失败: {0}")]
  Initialization(#[source] EstimatorError),
}

/// `list` 返回的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
  pub id: String,
  pub display_name: String,
}

/// `describe` 返回的模型详情
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDetails {
  pub id: String,
  pub display_name: String,
  pub aliases: Vec<String>,
  pub keypoints: Vec<String>,
  pub num_keypoints: usize,
  pub connections: Vec<(usize, usize)>,
}

/// 一个可注册的模型
pub struct ModelEntry {
  id: String,
  display_name: String,
  aliases: Vec<String>,
  defaults: ModelOptions,
  keypoints: &'static [&'static str],
  connections: &'static [(usize, usize)],
  constructor: Constructor,
}

impl ModelEntry {
  /// 标识与别名统一转为小写，骨架默认为 COCO-17
  pub fn new(id: &str, display_name: &str, constructor: Constructor) -> Self {
    Self {
      id: id.to_lowercase(),
      display_name: display_name.to_string(),
      aliases: Vec::new(),
      defaults: ModelOptions::new(),
      keypoints: &COCO_KEYPOINTS,
      connections: &COCO_SKELETON,
      constructor,
    }
  }

  pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
    self.aliases = aliases.iter().map(|a| a.to_lowercase()).collect();
    self
  }

  pub fn with_defaults(mut self, defaults: ModelOptions) -> Self {
    self.defaults = defaults;
    self
  }

  pub fn with_skeleton(
    mut self,
    keypoints: &'static [&'static str],
    connections: &'static [(usize, usize)],
  ) -> Self {
    self.keypoints = keypoints;
    self.connections = connections;
    self
  }

  fn names(&self) -> impl Iterator<Item = &str> {
    std::iter::once(self.id.as_str()).chain(self.aliases.iter().map(String::as_str))
  }

  fn matches(&self, name: &str) -> bool {
    self.names().any(|n| n == name)
  }
}

/// 模型标识到构造函数的映射
#[derive(Default)]
pub struct EstimatorRegistry {
  entries: Vec<ModelEntry>,
}

impl EstimatorRegistry {
  /// 空注册表
  pub fn new() -> Self {
    Self::default()
  }

  /// 包含本 crate 内置模型的注册表
  pub fn with_builtin() -> Self {
    #[allow(unused_mut)]
    let mut entries = vec![
      ModelEntry::new("stub", "Deterministic stub (testing)", build_stub)
        .with_aliases(&["dummy", "test"])
        .with_defaults(
          ModelOptions::new()
            .set("seed", 0)
            .set("confidence_threshold", 0.5),
        ),
    ];
    #[cfg(feature = "model_movenet")]
    entries.push(
      ModelEntry::new("movenet", "MoveNet single-pose (ONNX Runtime)", build_movenet)
        .with_aliases(&["movenet-lightning"])
        .with_defaults(
          ModelOptions::new()
            .set("model_complexity", 1)
            .set("min_detection_confidence", 0.5),
        ),
    );
    Self { entries }
  }

  /// 注册模型，标识或别名与已有模型重复时拒绝
  pub fn register(&mut self, entry: ModelEntry) -> Result<(), ConfigError> {
    if let Some(name) = entry.names().find(|n| self.lookup(n).is_some()) {
      warn!("模型 {} 已注册", name);
      return Err(ConfigError::DuplicateModel(name.to_string()));
    }
    debug!("注册模型: {} ({})", entry.id, entry.display_name);
    self.entries.push(entry);
    Ok(())
  }

  fn lookup(&self, name: &str) -> Option<&ModelEntry> {
    let name = name.to_lowercase();
    self.entries.iter().find(|e| e.matches(&name))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.lookup(name).is_some()
  }

  /// 别名对应的主标识
  pub fn resolve(&self, name: &str) -> Option<&str> {
    self.lookup(name).map(|e| e.id.as_str())
  }

  /// 按注册顺序列出模型，不含别名
  pub fn list(&self) -> Vec<ModelDescriptor> {
    self
      .entries
      .iter()
      .map(|e| ModelDescriptor {
        id: e.id.clone(),
        display_name: e.display_name.clone(),
      })
      .collect()
  }

  /// 用默认参数加上 `options` 构造模型（尚未初始化）
  pub fn create(&self, name: &str, options: &ModelOptions) -> Result<Estimator, ConfigError> {
    let entry = self.lookup(name).ok_or_else(|| ConfigError::UnknownModel {
      name: name.to_string(),
      available: self.entries.iter().map(|e| e.id.clone()).collect(),
    })?;
    let options = entry.defaults.merged(options);
    debug!("创建模型 {}, 参数: {:?}", entry.id, options);
    (entry.constructor)(&options)
  }

  /// 模型的关键点与骨架连线
  pub fn describe(&self, name: &str) -> Option<ModelDetails> {
    self.lookup(name).map(|entry| ModelDetails {
      id: entry.id.clone(),
      display_name: entry.display_name.clone(),
      aliases: entry.aliases.clone(),
      keypoints: entry.keypoints.iter().map(|s| s.to_string()).collect(),
      num_keypoints: entry.keypoints.len(),
      connections: entry.connections.to_vec(),
    })
  }
}

fn build_stub(options: &ModelOptions) -> Result<Estimator, ConfigError> {
  StubEstimator::from_options(options)
    .map(Estimator::from)
    .map_err(|e| ConfigError::InvalidOption(e.to_string()))
}

#[cfg(feature = "model_movenet")]
fn build_movenet(options: &ModelOptions) -> Result<Estimator, ConfigError> {
  crate::model::MoveNetEstimator::from_options(options)
    .map(Estimator::from)
    .map_err(|e| ConfigError::InvalidOption(e.to_string()))
}
