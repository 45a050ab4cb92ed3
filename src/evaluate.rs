// 该文件是 Shanan （山南西风） 项目的一部分。
// src/evaluate.rs - 结果评估与期望值校验
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

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::config::ExpectedResults;
use crate::dataset::Dataset;
use crate::detection::{BACKGROUND_CLASS, DetectionResults};

pub const TASK_BOX: &str = "box";
pub const TASK_SEGM: &str = "segm";
pub const TASK_KEYPOINTS: &str = "keypoints";

#[derive(Error, Debug)]
pub enum EvaluationError {
  #[error("数据集 {dataset} 有 {expected} 张图像，检测结果有 {actual} 张")]
  ImageCountMismatch {
    dataset: String,
    expected: usize,
    actual: usize,
  },
  #[error("写入评估结果 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("序列化评估结果失败: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// `数据集 -> 任务 -> 指标 -> 数值`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Metrics(BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>);

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, dataset: &str, task: &str, metric: &str, value: f64) {
    self
      .0
      .entry(dataset.to_string())
      .or_default()
      .entry(task.to_string())
      .or_default()
      .insert(metric.to_string(), value);
  }

  pub fn get(&self, dataset: &str, task: &str, metric: &str) -> Option<f64> {
    self.0.get(dataset)?.get(task)?.get(metric).copied()
  }

  pub fn extend(&mut self, other: Metrics) {
    for (dataset, tasks) in other.0 {
      let entry = self.0.entry(dataset).or_default();
      for (task, metrics) in tasks {
        entry.entry(task).or_default().extend(metrics);
      }
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str, f64)> {
    self.0.iter().flat_map(|(dataset, tasks)| {
      tasks.iter().flat_map(move |(task, metrics)| {
        metrics
          .iter()
          .map(move |(metric, value)| (dataset.as_str(), task.as_str(), metric.as_str(), *value))
      })
    })
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// 评估协作者：把检测结果与数据集真值对比，产出指标
pub trait Evaluator {
  type Error: std::error::Error + Send + Sync + 'static;

  fn evaluate(
    &self,
    dataset: &dyn Dataset,
    results: &DetectionResults,
    output_dir: &Path,
  ) -> Result<Metrics, Self::Error>;
}

/// 不依赖真值的结果摘要：检测数量与平均置信度
///
/// 摘要同时写入 `<output_dir>/detection_summary.json`。
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionSummary;

impl Evaluator for DetectionSummary {
  type Error = EvaluationError;

  fn evaluate(
    &self,
    dataset: &dyn Dataset,
    results: &DetectionResults,
    output_dir: &Path,
  ) -> Result<Metrics, EvaluationError> {
    if dataset.record_count() != results.num_images() {
      return Err(EvaluationError::ImageCountMismatch {
        dataset: dataset.name().to_string(),
        expected: dataset.record_count(),
        actual: results.num_images(),
      });
    }

    let name = dataset.name();
    let mut metrics = Metrics::new();
    let mut count = 0usize;
    let mut score_sum = 0f64;
    let mut images_with_detections = 0usize;
    for image in 0..results.num_images() {
      let mut found = false;
      for class in (BACKGROUND_CLASS + 1)..results.num_classes() {
        let boxes = results.all_boxes.get(class, image).unwrap_or_default();
        count += boxes.len();
        score_sum += boxes.iter().map(|b| b.score as f64).sum::<f64>();
        found |= !boxes.is_empty();
      }
      images_with_detections += found as usize;
    }

    metrics.insert(name, TASK_BOX, "detections", count as f64);
    metrics.insert(
      name,
      TASK_BOX,
      "mean_score",
      if count > 0 { score_sum / count as f64 } else { 0.0 },
    );
    metrics.insert(
      name,
      TASK_BOX,
      "images_with_detections",
      images_with_detections as f64,
    );
    let masks = results.all_segms.total();
    if masks > 0 {
      metrics.insert(name, TASK_SEGM, "masks", masks as f64);
    }
    let keypoints = results.all_keyps.total();
    if keypoints > 0 {
      metrics.insert(name, TASK_KEYPOINTS, "instances", keypoints as f64);
    }

    let path = output_dir.join("detection_summary.json");
    let text = serde_json::to_string_pretty(&metrics)?;
    std::fs::write(&path, text).map_err(|source| EvaluationError::Io {
      path: path.clone(),
      source,
    })?;
    info!("评估摘要已写入 {}", path.display());
    Ok(metrics)
  }
}

/// 以便于复制的形式输出全部指标
pub fn log_copy_paste_friendly(metrics: &Metrics) {
  for (dataset, task, metric, value) in metrics.iter() {
    info!("copypaste: {},{},{},{:.4}", dataset, task, metric, value);
  }
}

fn within_tolerance(actual: f64, expected: f64, atol: f64, rtol: f64) -> bool {
  (actual - expected).abs() <= atol + rtol * expected.abs()
}

/// 校验指标是否落在期望值的容差内：`|a - e| <= atol + rtol * |e|`
///
/// 不一致只记录错误日志，返回值仅供调用者参考，不影响进程退出状态。
pub fn check_expected(metrics: &Metrics, expected: &ExpectedResults) -> bool {
  if !expected.check {
    return true;
  }

  let mut passed = true;
  for item in &expected.values {
    match metrics.get(&item.dataset, &item.task, &item.metric) {
      Some(actual) if within_tolerance(actual, item.value, expected.atol, expected.rtol) => {
        info!(
          "{}/{}/{}: {:.4} 符合期望 {:.4}",
          item.dataset, item.task, item.metric, actual, item.value
        );
      }
      Some(actual) => {
        error!(
          "{}/{}/{}: {:.4} 偏离期望 {:.4} (atol={}, rtol={})",
          item.dataset, item.task, item.metric, actual, item.value, expected.atol, expected.rtol
        );
        passed = false;
      }
      None => {
        error!(
          "{}/{}/{}: 没有对应的评估结果",
          item.dataset, item.task, item.metric
        );
        passed = false;
      }
    }
  }

  if passed {
    info!("全部期望值校验通过");
  } else {
    error!("期望值校验失败");
  }
  passed
}
