// 该文件是 Shanan （山南西风） 项目的一部分。
// src/calibrate.rs - int8 量化校准
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

//! 校准器的生命周期为 `Idle -> Collecting -> Computed -> Quantized`。
//!
//! 推理期间校准器作为观察者接收每个激活张量，按所选策略累积统计量；
//! 统计量只被消费一次，用于计算每个张量的量化参数，随后改写浮点子图。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CalibrationStrategy, QuantizationConfig};
use crate::graph::{NetDef, Workspace};
use crate::model::InferenceObserver;

mod absmax;
mod ema;
mod kl;
mod quantize;

pub use self::absmax::AbsmaxStatistics;
pub use self::ema::EmaStatistics;
pub use self::kl::{KlStatistics, kl_threshold};
pub use self::quantize::{QuantizedNet, quantize_net};

/// 对称 int8 的最大量化值
pub const INT8_MAX: f32 = 127.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CalibrationError {
  #[error("校准器处于 {actual} 状态，无法执行 {operation}")]
  InvalidState {
    actual: CalibrationState,
    operation: &'static str,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
  Idle,
  Collecting,
  Computed,
  Quantized,
}

impl fmt::Display for CalibrationState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CalibrationState::Idle => write!(f, "Idle"),
      CalibrationState::Collecting => write!(f, "Collecting"),
      CalibrationState::Computed => write!(f, "Computed"),
      CalibrationState::Quantized => write!(f, "Quantized"),
    }
  }
}

/// 单个张量的量化参数
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
  pub scale: f32,
  pub zero_point: i32,
}

impl QuantParams {
  /// 对称量化：`scale = threshold / 127`；阈值退化（全零或非有限值）时取 1.0
  pub fn from_threshold(threshold: f32) -> Self {
    let scale = if threshold > 0.0 && threshold.is_finite() {
      threshold / INT8_MAX
    } else {
      1.0
    };
    Self {
      scale,
      zero_point: 0,
    }
  }

  pub fn quantize(&self, value: f32) -> i8 {
    let q = (value / self.scale).round() as i32 + self.zero_point;
    q.clamp(i8::MIN as i32, i8::MAX as i32) as i8
  }

  pub fn dequantize(&self, value: i8) -> f32 {
    (value as i32 - self.zero_point) as f32 * self.scale
  }
}

/// 单个张量的统计量累积器
pub trait TensorStatistics: Send {
  /// `image` 为校准图像序号，从 0 开始
  fn observe(&mut self, values: &[f32], image: usize);

  /// 量化阈值；从未观察到数据时返回 `None`
  fn threshold(&self) -> Option<f32>;
}

pub(crate) fn abs_max(values: &[f32]) -> f32 {
  values
    .iter()
    .filter(|v| v.is_finite())
    .fold(0.0f32, |acc, v| acc.max(v.abs()))
}

pub struct Calibrator {
  strategy: CalibrationStrategy,
  ema_alpha: f32,
  kl_range_images: usize,
  histogram_bins: usize,
  max_images: Option<usize>,
  state: CalibrationState,
  images_seen: usize,
  observing: bool,
  /// 子图名 -> 张量名 -> 统计量
  statistics: BTreeMap<String, BTreeMap<String, Box<dyn TensorStatistics>>>,
  params: BTreeMap<String, BTreeMap<String, QuantParams>>,
}

impl Calibrator {
  pub fn new(config: &QuantizationConfig) -> Self {
    let max_images = match config.strategy {
      CalibrationStrategy::KlDivergence => Some(2 * config.kl_calibration_images),
      _ => None,
    };
    Self {
      strategy: config.strategy,
      ema_alpha: config.ema_alpha,
      kl_range_images: config.kl_calibration_images,
      histogram_bins: config.histogram_bins,
      max_images,
      state: CalibrationState::Idle,
      images_seen: 0,
      observing: false,
      statistics: BTreeMap::new(),
      params: BTreeMap::new(),
    }
  }

  /// 限制参与统计的图像数
  pub fn with_max_images(mut self, max_images: Option<usize>) -> Self {
    self.max_images = max_images;
    self
  }

  pub fn strategy(&self) -> CalibrationStrategy {
    self.strategy
  }

  pub fn state(&self) -> CalibrationState {
    self.state
  }

  pub fn images_seen(&self) -> usize {
    self.images_seen
  }

  fn new_statistics(&self) -> Box<dyn TensorStatistics> {
    match self.strategy {
      CalibrationStrategy::Absmax => Box::new(AbsmaxStatistics::default()),
      CalibrationStrategy::MovingAverage => Box::new(EmaStatistics::new(self.ema_alpha)),
      CalibrationStrategy::KlDivergence => {
        Box::new(KlStatistics::new(self.kl_range_images, self.histogram_bins))
      }
    }
  }

  /// 开始处理一张图像，返回本图像的激活值是否参与统计
  pub fn begin_image(&mut self) -> bool {
    match self.state {
      CalibrationState::Idle => {
        info!("开始收集校准统计量，策略: {:?}", self.strategy);
        self.state = CalibrationState::Collecting;
      }
      CalibrationState::Collecting => {}
      _ => {
        self.observing = false;
        return false;
      }
    }

    self.observing = self.max_images.is_none_or(|max| self.images_seen < max);
    if self.observing && self.max_images == Some(self.images_seen + 1) {
      info!("最后一张校准图像: 第 {} 张", self.images_seen + 1);
    }
    self.observing
  }

  pub fn end_image(&mut self) {
    if self.observing {
      self.images_seen += 1;
      self.observing = false;
    }
  }

  pub fn observe(&mut self, net: &str, blob: &str, values: &[f32]) {
    if self.state != CalibrationState::Collecting || !self.observing {
      return;
    }
    let image = self.images_seen;
    if !self.statistics.get(net).is_some_and(|m| m.contains_key(blob)) {
      let stats = self.new_statistics();
      self
        .statistics
        .entry(net.to_string())
        .or_default()
        .insert(blob.to_string(), stats);
    }
    if let Some(stats) = self.statistics.get_mut(net).and_then(|m| m.get_mut(blob)) {
      stats.observe(values, image);
    }
  }

  /// 消费统计量，固定每个张量的量化参数
  pub fn compute(&mut self) -> Result<(), CalibrationError> {
    if self.state != CalibrationState::Collecting {
      return Err(CalibrationError::InvalidState {
        actual: self.state,
        operation: "compute",
      });
    }

    let statistics = std::mem::take(&mut self.statistics);
    for (net, tensors) in statistics {
      let params = self.params.entry(net).or_default();
      for (blob, stats) in tensors {
        if let Some(threshold) = stats.threshold() {
          if threshold <= 0.0 {
            warn!("张量 {} 的激活值全部为零，使用默认量化尺度", blob);
          }
          params.insert(blob, QuantParams::from_threshold(threshold));
        }
      }
    }
    info!(
      "校准完成: {} 张图像, {} 个张量",
      self.images_seen,
      self.params.values().map(BTreeMap::len).sum::<usize>()
    );
    self.state = CalibrationState::Computed;
    Ok(())
  }

  pub fn params(&self, net: &str, blob: &str) -> Option<QuantParams> {
    self.params.get(net).and_then(|m| m.get(blob)).copied()
  }

  /// 把浮点子图改写为 int8 推理子图与初始化子图
  ///
  /// 子图未命名时跳过，返回 `None`。
  pub fn quantize(
    &mut self,
    workspace: &Workspace,
    net: &NetDef,
  ) -> Result<Option<QuantizedNet>, CalibrationError> {
    if self.state == CalibrationState::Collecting {
      self.compute()?;
    }
    if !matches!(
      self.state,
      CalibrationState::Computed | CalibrationState::Quantized
    ) {
      return Err(CalibrationError::InvalidState {
        actual: self.state,
        operation: "quantize",
      });
    }
    if !net.is_named() {
      warn!("子图未命名，跳过量化");
      return Ok(None);
    }

    let empty = BTreeMap::new();
    let params = self.params.get(&net.name).unwrap_or(&empty);
    if params.is_empty() {
      warn!("子图 {} 没有收集到任何激活统计量，保持浮点", net.name);
    }
    let quantized = quantize_net(net, workspace, params);
    self.state = CalibrationState::Quantized;
    Ok(Some(quantized))
  }
}

impl InferenceObserver for Calibrator {
  fn on_activation(&mut self, net: &str, blob: &str, values: &[f32]) {
    self.observe(net, blob, values);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config(strategy: CalibrationStrategy) -> QuantizationConfig {
    QuantizationConfig {
      calibrate: true,
      strategy,
      kl_calibration_images: 2,
      ..Default::default()
    }
  }

  fn feed(calibrator: &mut Calibrator, images: &[&[f32]]) {
    for values in images {
      if calibrator.begin_image() {
        calibrator.on_activation("net", "x", values);
      }
      calibrator.end_image();
    }
  }

  #[test]
  fn state_machine_progression() {
    let mut calibrator = Calibrator::new(&config(CalibrationStrategy::Absmax));
    assert_eq!(calibrator.state(), CalibrationState::Idle);
    assert!(calibrator.compute().is_err());

    feed(&mut calibrator, &[&[1.0, -2.0]]);
    assert_eq!(calibrator.state(), CalibrationState::Collecting);

    calibrator.compute().unwrap();
    assert_eq!(calibrator.state(), CalibrationState::Computed);
    assert!(calibrator.compute().is_err());

    // 计算后不再收集
    assert!(!calibrator.begin_image());
    calibrator.on_activation("net", "x", &[100.0]);
    assert_eq!(calibrator.params("net", "x").unwrap().scale, 2.0 / 127.0);
  }

  #[test]
  fn quantize_requires_statistics() {
    let mut calibrator = Calibrator::new(&config(CalibrationStrategy::Absmax));
    let err = calibrator
      .quantize(&Workspace::default(), &NetDef::named("net"))
      .unwrap_err();
    assert_eq!(
      err,
      CalibrationError::InvalidState {
        actual: CalibrationState::Idle,
        operation: "quantize"
      }
    );
  }

  #[test]
  fn unnamed_net_is_skipped() {
    let mut calibrator = Calibrator::new(&config(CalibrationStrategy::Absmax));
    feed(&mut calibrator, &[&[1.0]]);
    let result = calibrator.quantize(&Workspace::default(), &NetDef::default()).unwrap();
    assert!(result.is_none());
    assert_eq!(calibrator.state(), CalibrationState::Computed);
  }

  #[test]
  fn scale_is_positive_and_finite_for_all_strategies() {
    let images: Vec<Vec<f32>> = (0..6)
      .map(|i| (0..512).map(|k| ((k * 37 + i * 11) % 97) as f32 / 10.0 - 4.0).collect())
      .collect();
    let refs: Vec<&[f32]> = images.iter().map(Vec::as_slice).collect();

    for strategy in [
      CalibrationStrategy::Absmax,
      CalibrationStrategy::MovingAverage,
      CalibrationStrategy::KlDivergence,
    ] {
      let mut calibrator = Calibrator::new(&config(strategy));
      feed(&mut calibrator, &refs);
      calibrator.compute().unwrap();
      let scale = calibrator.params("net", "x").unwrap().scale;
      assert!(scale > 0.0 && scale.is_finite(), "{:?}: {}", strategy, scale);
    }
  }

  #[test]
  fn kl_stops_after_bounded_images() {
    let mut calibrator = Calibrator::new(&config(CalibrationStrategy::KlDivergence));
    let observed: Vec<bool> = (0..6)
      .map(|_| {
        let observing = calibrator.begin_image();
        calibrator.end_image();
        observing
      })
      .collect();
    assert_eq!(observed, vec![true, true, true, true, false, false]);
    assert_eq!(calibrator.images_seen(), 4);
  }

  #[test]
  fn degenerate_statistics_use_unit_scale() {
    let mut calibrator = Calibrator::new(&config(CalibrationStrategy::Absmax));
    feed(&mut calibrator, &[&[0.0, 0.0]]);
    calibrator.compute().unwrap();
    assert_eq!(calibrator.params("net", "x").unwrap().scale, 1.0);
  }

  #[test]
  fn quant_params_round_trip_within_half_step() {
    let params = QuantParams::from_threshold(12.7);
    for v in [-12.7f32, -3.33, 0.0, 0.04, 6.5, 12.7] {
      let back = params.dequantize(params.quantize(v));
      assert!((back - v).abs() <= params.scale / 2.0 + 1e-6);
    }
    assert_eq!(params.quantize(1000.0), 127);
  }
}
