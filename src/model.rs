// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dataset::ImageRecord;
use crate::detection::ImageDetections;
use crate::graph::{NetDef, Workspace};
use crate::timer::Timers;

/// 模型支持的输出种类，在加载时查询一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
  pub masks: bool,
  pub keypoints: bool,
  /// 仅生成候选框
  pub proposals_only: bool,
}

/// 模型中的可量化子图
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetRole {
  Detection,
  Mask,
  Keypoint,
}

impl NetRole {
  pub const ALL: [NetRole; 3] = [NetRole::Detection, NetRole::Mask, NetRole::Keypoint];

  pub fn is_supported(&self, capabilities: &Capabilities) -> bool {
    match self {
      NetRole::Detection => true,
      NetRole::Mask => capabilities.masks,
      NetRole::Keypoint => capabilities.keypoints,
    }
  }
}

/// 推理过程中的旁路观察者：激活值与算子耗时
pub trait InferenceObserver {
  fn on_activation(&mut self, _net: &str, _blob: &str, _values: &[f32]) {}
  fn on_op_timing(&mut self, _net: &str, _op: &str, _elapsed: Duration) {}
}

/// 不做任何事的观察者
pub struct NoObserver;

impl InferenceObserver for NoObserver {}

/// 把事件分发给多个观察者
pub struct Observers<'a> {
  observers: Vec<&'a mut dyn InferenceObserver>,
}

impl<'a> Observers<'a> {
  pub fn new() -> Self {
    Self {
      observers: Vec::new(),
    }
  }

  pub fn with(mut self, observer: Option<&'a mut dyn InferenceObserver>) -> Self {
    if let Some(observer) = observer {
      self.observers.push(observer);
    }
    self
  }
}

impl Default for Observers<'_> {
  fn default() -> Self {
    Self::new()
  }
}

impl InferenceObserver for Observers<'_> {
  fn on_activation(&mut self, net: &str, blob: &str, values: &[f32]) {
    for observer in self.observers.iter_mut() {
      observer.on_activation(net, blob, values);
    }
  }

  fn on_op_timing(&mut self, net: &str, op: &str, elapsed: Duration) {
    for observer in self.observers.iter_mut() {
      observer.on_op_timing(net, op, elapsed);
    }
  }
}

/// 检测模型
///
/// 推理本身对本库不透明：模型对单张图像给出按类别索引的框、掩码和关键点，
/// 并通过观察者上报激活值与算子耗时。
pub trait Model {
  type Error: std::error::Error + Send + Sync + 'static;

  fn capabilities(&self) -> Capabilities;

  /// `proposals` 为已过滤掉真值框的预计算候选框
  fn infer(
    &self,
    record: &ImageRecord,
    proposals: Option<&[[f32; 4]]>,
    timers: &mut Timers,
    observer: &mut dyn InferenceObserver,
  ) -> Result<ImageDetections, Self::Error>;

  fn net(&self, role: NetRole) -> Option<&NetDef>;

  /// 同时借出子图与工作空间，用于加载 int8 子图
  fn net_and_workspace_mut(&mut self, role: NetRole) -> Option<(&mut NetDef, &mut Workspace)>;

  fn workspace(&self) -> &Workspace;
}

pub const INT8_WORKSPACE: &str = "__int8_ws__";
pub const FP32_WORKSPACE: &str = "__fp32_ws__";

/// 模型加载选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
  pub device: usize,
  /// 模型执行上下文的名称，协同仿真时两个模型使用不同名称
  pub workspace: String,
  /// 是否允许用 int8 子图替换浮点子图
  pub int8: bool,
}

impl LoadOptions {
  pub fn primary(device: usize) -> Self {
    Self {
      device,
      workspace: INT8_WORKSPACE.to_string(),
      int8: true,
    }
  }

  /// 协同仿真中的浮点参考模型
  pub fn reference(device: usize) -> Self {
    Self {
      device,
      workspace: FP32_WORKSPACE.to_string(),
      int8: false,
    }
  }
}

/// 从权重文件构造模型
pub trait ModelLoader {
  type Model: Model;
  type Error: std::error::Error + Send + Sync + 'static;

  fn load(
    &self,
    weights: &Path,
    options: &LoadOptions,
    config: &Config,
  ) -> Result<Self::Model, Self::Error>;
}

mod replay;
pub use self::replay::{ReplayError, ReplayLoader, ReplayModel, ReplayRecording};
