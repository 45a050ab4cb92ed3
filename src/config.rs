// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 运行配置
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

//! 配置在启动时一次性加载并校验，之后以只读引用传给各个组件。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::graph::GraphFormat;
use crate::partition::PartitionError;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("解析配置文件 {path} 失败: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("配置无效: {0}")]
  Invalid(String),
  #[error("子进程只能处理单个数据集，实际配置了 {0} 个")]
  WorkerMultipleDatasets(usize),
  #[error("子进程只能处理单个候选框文件，实际配置了 {0} 个")]
  WorkerMultipleProposalFiles(usize),
  #[error("使用预计算候选框时每个数据集必须对应一个候选框文件: {datasets} 个数据集, {proposal_files} 个文件")]
  ProposalFileCountMismatch {
    datasets: usize,
    proposal_files: usize,
  },
  #[error("数据集索引 {0} 越界")]
  DatasetIndexOutOfRange(usize),
  #[error("仅生成候选框的模型不能走通用推理流程，请使用候选框生成流程")]
  ProposalOnlyModel,
  #[error("量化校准必须在单进程中覆盖整个数据集，{0}")]
  PartialCalibration(String),
  #[error("划分失败: {0}")]
  Partition(#[from] PartitionError),
}

/// 量化校准的统计策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CalibrationStrategy {
  #[default]
  Absmax,
  MovingAverage,
  KlDivergence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
  /// 包含背景类别在内的类别数
  pub num_classes: usize,
  /// 仅生成候选框的模型
  pub rpn_only: bool,
  pub mask_on: bool,
  pub keypoints_on: bool,
}

impl Default for ModelConfig {
  fn default() -> Self {
    Self {
      num_classes: 81,
      rpn_only: false,
      mask_on: false,
      keypoints_on: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
  pub datasets: Vec<String>,
  pub proposal_files: Vec<PathBuf>,
  pub precomputed_proposals: bool,
  pub proposal_limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationConfig {
  /// 推理结束后执行校准并输出 int8 子图
  pub calibrate: bool,
  pub strategy: CalibrationStrategy,
  /// KL 散度策略用于确定取值范围的图像数
  pub kl_calibration_images: usize,
  /// 滑动平均策略的衰减系数
  pub ema_alpha: f32,
  pub histogram_bins: usize,
  /// 使用可读文本格式保存/加载子图
  pub text_format: bool,
  /// 启动时从该目录加载 int8 子图
  pub int8_path: Option<PathBuf>,
  /// int8 子图输出目录，缺省为数据集输出目录
  pub output_dir: Option<PathBuf>,
}

impl Default for QuantizationConfig {
  fn default() -> Self {
    Self {
      calibrate: false,
      strategy: CalibrationStrategy::Absmax,
      kl_calibration_images: 100,
      ema_alpha: 0.5,
      histogram_bins: 2048,
      text_format: false,
      int8_path: None,
      output_dir: None,
    }
  }
}

impl QuantizationConfig {
  pub fn graph_format(&self) -> GraphFormat {
    if self.text_format {
      GraphFormat::Text
    } else {
      GraphFormat::Binary
    }
  }

  /// KL 散度校准所需的最少记录数
  pub fn calibration_records(&self) -> Option<usize> {
    match (self.calibrate, self.strategy) {
      (true, CalibrationStrategy::KlDivergence) => Some(2 * self.kl_calibration_images),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
  /// 同时运行浮点模型与量化模型进行对比
  pub cosim: bool,
  /// 挂载算子计时观察器
  pub profile: bool,
  /// 给未命名算子自动命名并导出优化后的子图
  pub debug_name_ops: bool,
  pub disable_optimization: bool,
  /// 正式推理前先完整跑一遍数据集，结果丢弃
  pub warmup_pass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// 子进程可执行文件，缺省在当前可执行文件旁查找 `test-net`
  pub binary: Option<PathBuf>,
  /// 单个子进程的超时时间（秒），缺省不限时
  pub timeout_secs: Option<u64>,
  pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      binary: None,
      timeout_secs: None,
      poll_interval_ms: 200,
    }
  }
}

impl WorkerConfig {
  pub fn timeout(&self) -> Option<Duration> {
    self.timeout_secs.map(Duration::from_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms.max(1))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedMetric {
  pub dataset: String,
  pub task: String,
  pub metric: String,
  pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpectedResults {
  pub check: bool,
  pub atol: f64,
  pub rtol: f64,
  pub values: Vec<ExpectedMetric>,
}

impl Default for ExpectedResults {
  fn default() -> Self {
    Self {
      check: false,
      atol: 0.005,
      rtol: 0.1,
      values: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub model: ModelConfig,
  pub test: TestConfig,
  pub dataset_root: PathBuf,
  pub output_root: PathBuf,
  /// 每处理多少张图像汇报一次进度
  pub log_interval: usize,
  pub quantization: QuantizationConfig,
  pub runtime: RuntimeConfig,
  pub workers: WorkerConfig,
  pub expected_results: ExpectedResults,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      model: ModelConfig::default(),
      test: TestConfig::default(),
      dataset_root: PathBuf::from("datasets"),
      output_root: PathBuf::from("output"),
      log_interval: 10,
      quantization: QuantizationConfig::default(),
      runtime: RuntimeConfig::default(),
      workers: WorkerConfig::default(),
      expected_results: ExpectedResults::default(),
    }
  }
}

impl Config {
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    info!("加载配置文件: {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    config.validate()?;
    Ok(config)
  }

  pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
    std::fs::write(path, self.snapshot()).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })
  }

  /// 子进程的配置：只保留一个数据集及其候选框文件
  pub fn for_worker(mut self, dataset: String, proposal_file: Option<PathBuf>) -> Self {
    self.test.datasets = vec![dataset];
    self.test.proposal_files = proposal_file.into_iter().collect();
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.model.num_classes < 2 {
      return Err(ConfigError::Invalid(format!(
        "类别数必须至少为 2（含背景），实际为 {}",
        self.model.num_classes
      )));
    }
    if self.log_interval == 0 {
      return Err(ConfigError::Invalid("log_interval 必须大于 0".into()));
    }
    if self.test.precomputed_proposals && self.test.proposal_files.len() != self.test.datasets.len() {
      return Err(ConfigError::ProposalFileCountMismatch {
        datasets: self.test.datasets.len(),
        proposal_files: self.test.proposal_files.len(),
      });
    }

    let quant = &self.quantization;
    if quant.kl_calibration_images == 0 {
      return Err(ConfigError::Invalid("kl_calibration_images 必须大于 0".into()));
    }
    if !(quant.ema_alpha > 0.0 && quant.ema_alpha < 1.0) {
      return Err(ConfigError::Invalid(format!(
        "ema_alpha 必须在 (0, 1) 区间内，实际为 {}",
        quant.ema_alpha
      )));
    }
    if quant.histogram_bins < 256 {
      return Err(ConfigError::Invalid(format!(
        "histogram_bins 至少为 256，实际为 {}",
        quant.histogram_bins
      )));
    }
    Ok(())
  }

  /// 当前配置的文本快照，随检测结果一起保存
  pub fn snapshot(&self) -> String {
    serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("<配置序列化失败: {}>", e))
  }

  /// 取得第 `index` 个数据集及其候选框文件
  ///
  /// 子进程（`is_parent == false`）只能持有一个数据集和至多一个候选框文件。
  pub fn inference_dataset(
    &self,
    index: usize,
    is_parent: bool,
  ) -> Result<(String, Option<PathBuf>), ConfigError> {
    if !is_parent && self.test.datasets.len() != 1 {
      return Err(ConfigError::WorkerMultipleDatasets(self.test.datasets.len()));
    }
    let dataset = self
      .test
      .datasets
      .get(index)
      .cloned()
      .ok_or(ConfigError::DatasetIndexOutOfRange(index))?;

    if !self.test.precomputed_proposals {
      return Ok((dataset, None));
    }

    if !is_parent && self.test.proposal_files.len() != 1 {
      return Err(ConfigError::WorkerMultipleProposalFiles(
        self.test.proposal_files.len(),
      ));
    }
    if self.test.proposal_files.len() != self.test.datasets.len() {
      return Err(ConfigError::ProposalFileCountMismatch {
        datasets: self.test.datasets.len(),
        proposal_files: self.test.proposal_files.len(),
      });
    }
    Ok((dataset, Some(self.test.proposal_files[index].clone())))
  }

  pub fn output_dir(&self, dataset: &str) -> PathBuf {
    self.output_root.join("test").join(dataset)
  }

  pub fn ensure_generic_inference(&self) -> Result<(), ConfigError> {
    if self.model.rpn_only {
      return Err(ConfigError::ProposalOnlyModel);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn two_datasets() -> Config {
    let mut config = Config::default();
    config.test.datasets = vec!["coco_val".into(), "coco_minival".into()];
    config
  }

  #[test]
  fn parent_may_hold_several_datasets() {
    let config = two_datasets();
    let (name, proposals) = config.inference_dataset(1, true).unwrap();
    assert_eq!(name, "coco_minival");
    assert!(proposals.is_none());
  }

  #[test]
  fn worker_rejects_several_datasets() {
    let config = two_datasets();
    assert!(matches!(
      config.inference_dataset(0, false),
      Err(ConfigError::WorkerMultipleDatasets(2))
    ));
  }

  #[test]
  fn worker_rejects_several_proposal_files() {
    let mut config = Config::default();
    config.test.datasets = vec!["coco_val".into()];
    config.test.precomputed_proposals = true;
    config.test.proposal_files = vec!["a.json".into(), "b.json".into()];
    assert!(matches!(
      config.inference_dataset(0, false),
      Err(ConfigError::WorkerMultipleProposalFiles(2))
    ));
  }

  #[test]
  fn proposal_count_must_match_datasets() {
    let mut config = two_datasets();
    config.test.precomputed_proposals = true;
    config.test.proposal_files = vec!["a.json".into()];
    assert!(matches!(
      config.validate(),
      Err(ConfigError::ProposalFileCountMismatch { .. })
    ));
    assert!(matches!(
      config.inference_dataset(0, true),
      Err(ConfigError::ProposalFileCountMismatch { .. })
    ));
  }

  #[test]
  fn worker_override_keeps_single_dataset() {
    let mut config = two_datasets();
    config.test.precomputed_proposals = true;
    config.test.proposal_files = vec!["a.json".into(), "b.json".into()];
    let worker = config.for_worker("coco_val".into(), Some("a.json".into()));
    assert_eq!(
      worker.inference_dataset(0, false).unwrap(),
      ("coco_val".to_string(), Some(PathBuf::from("a.json")))
    );
  }

  #[test]
  fn rejects_bad_calibration_settings() {
    let mut config = Config::default();
    config.quantization.ema_alpha = 1.5;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.quantization.kl_calibration_images = 0;
    assert!(config.validate().is_err());
  }

  #[test]
  fn snapshot_round_trips() {
    let mut config = two_datasets();
    config.quantization.strategy = CalibrationStrategy::KlDivergence;
    let parsed: Config = serde_json::from_str(&config.snapshot()).unwrap();
    assert_eq!(parsed, config);
  }

  #[test]
  fn partial_config_uses_defaults() {
    let parsed: Config =
      serde_json::from_str(r#"{ "model": { "num_classes": 3 }, "quantization": { "strategy": "moving-average" } }"#)
        .unwrap();
    assert_eq!(parsed.model.num_classes, 3);
    assert_eq!(parsed.log_interval, 10);
    assert_eq!(parsed.quantization.strategy, CalibrationStrategy::MovingAverage);
    assert_eq!(parsed.quantization.ema_alpha, 0.5);
  }

  #[test]
  fn proposal_only_model_is_rejected() {
    let mut config = Config::default();
    config.model.rpn_only = true;
    assert!(matches!(
      config.ensure_generic_inference(),
      Err(ConfigError::ProposalOnlyModel)
    ));
  }
}
