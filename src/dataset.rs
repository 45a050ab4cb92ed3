// 该文件是 Shanan （山南西风） 项目的一部分。
// src/dataset.rs - 数据集与候选框
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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::partition::IndexRange;

/// `gt_class` 取该值表示这是候选框而不是真值框
pub const NO_GROUND_TRUTH: u32 = 0;

#[derive(Error, Debug)]
pub enum DatasetError {
  #[error("读取 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("解析 {path} 失败: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("启用了预计算候选框，但没有提供候选框文件")]
  MissingProposalFile,
  #[error("候选框文件 {path} 包含 {actual} 张图像的候选框，数据集有 {expected} 张")]
  ProposalCountMismatch {
    path: PathBuf,
    expected: usize,
    actual: usize,
  },
  #[error("区间 {range} 超出数据集范围 (共 {total} 张)")]
  RangeOutOfBounds { range: IndexRange, total: usize },
}

/// 一张待推理的图像
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageRecord {
  pub image: PathBuf,
  /// 真值框与候选框，`gt_classes` 与其一一对应
  #[serde(default)]
  pub boxes: Vec<[f32; 4]>,
  #[serde(default)]
  pub gt_classes: Vec<u32>,
}

impl ImageRecord {
  pub fn new(image: impl Into<PathBuf>) -> Self {
    Self {
      image: image.into(),
      ..Default::default()
    }
  }

  /// 排除真值框后的候选框
  pub fn non_gt_proposals(&self) -> Vec<[f32; 4]> {
    self
      .boxes
      .iter()
      .zip(&self.gt_classes)
      .filter(|(_, class)| **class == NO_GROUND_TRUTH)
      .map(|(bbox, _)| *bbox)
      .collect()
  }
}

/// 数据集提供者暴露的只读视图
pub trait Dataset {
  fn name(&self) -> &str;
  fn records(&self) -> &[ImageRecord];

  fn record_count(&self) -> usize {
    self.records().len()
  }
}

/// 按名称打开数据集
pub trait DatasetProvider {
  type Dataset: Dataset;

  fn open(
    &self,
    name: &str,
    proposal_file: Option<&Path>,
    proposal_limit: Option<usize>,
  ) -> Result<Self::Dataset, DatasetError>;

  /// 只需要图像数量时可以覆盖以避免加载候选框
  fn record_count(&self, name: &str) -> Result<usize, DatasetError> {
    Ok(self.open(name, None, None)?.record_count())
  }
}

/// 取数据集的一个子区间；`range` 为 `None` 时返回全部记录
pub fn select_range(
  records: &[ImageRecord],
  range: Option<IndexRange>,
) -> Result<(Vec<ImageRecord>, IndexRange, usize), DatasetError> {
  let total = records.len();
  let range = range.unwrap_or(IndexRange::new(0, total));
  if range.end > total || range.start > range.end {
    return Err(DatasetError::RangeOutOfBounds { range, total });
  }
  Ok((records[range.start..range.end].to_vec(), range, total))
}

/// KL 散度校准要求至少 `required` 条记录，不足时把记录列表整体翻倍直到满足
///
/// 原有记录的顺序与内容保持不变。
pub fn extend_for_calibration(records: &mut Vec<ImageRecord>, required: usize) {
  if records.is_empty() {
    warn!("数据集为空，无法扩充校准记录");
    return;
  }
  let original = records.len();
  while records.len() < required {
    let copy = records.clone();
    records.extend(copy);
  }
  if records.len() != original {
    info!("校准记录由 {} 条扩充到 {} 条", original, records.len());
  }
}

#[derive(Debug, Deserialize)]
struct Manifest {
  #[serde(default)]
  image_root: Option<PathBuf>,
  images: Vec<ManifestImage>,
}

#[derive(Debug, Deserialize)]
struct ManifestImage {
  image: PathBuf,
  #[serde(default)]
  gt_boxes: Vec<GroundTruth>,
}

#[derive(Debug, Deserialize)]
struct GroundTruth {
  bbox: [f32; 4],
  class: u32,
}

#[derive(Debug, Deserialize)]
struct ProposalFile {
  boxes: Vec<Vec<[f32; 4]>>,
}

/// 以 JSON 清单描述的数据集
#[derive(Debug, Clone)]
pub struct JsonDataset {
  name: String,
  records: Vec<ImageRecord>,
}

impl Dataset for JsonDataset {
  fn name(&self) -> &str {
    &self.name
  }

  fn records(&self) -> &[ImageRecord] {
    &self.records
  }
}

/// 从 `<root>/<name>.json` 加载数据集
#[derive(Debug, Clone)]
pub struct JsonDatasetProvider {
  root: PathBuf,
}

impl JsonDatasetProvider {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn manifest_path(&self, name: &str) -> PathBuf {
    self.root.join(format!("{}.json", name))
  }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DatasetError> {
  let text = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  serde_json::from_str(&text).map_err(|source| DatasetError::Parse {
    path: path.to_path_buf(),
    source,
  })
}

impl DatasetProvider for JsonDatasetProvider {
  type Dataset = JsonDataset;

  fn open(
    &self,
    name: &str,
    proposal_file: Option<&Path>,
    proposal_limit: Option<usize>,
  ) -> Result<JsonDataset, DatasetError> {
    let path = self.manifest_path(name);
    info!("加载数据集 {}: {}", name, path.display());
    let manifest: Manifest = read_json(&path)?;
    let image_root = manifest
      .image_root
      .unwrap_or_else(|| path.parent().map(Path::to_path_buf).unwrap_or_default());

    let mut records: Vec<ImageRecord> = manifest
      .images
      .into_iter()
      .map(|entry| ImageRecord {
        image: image_root.join(entry.image),
        boxes: entry.gt_boxes.iter().map(|gt| gt.bbox).collect(),
        gt_classes: entry.gt_boxes.iter().map(|gt| gt.class).collect(),
      })
      .collect();

    if let Some(proposal_path) = proposal_file {
      let proposals: ProposalFile = read_json(proposal_path)?;
      if proposals.boxes.len() != records.len() {
        return Err(DatasetError::ProposalCountMismatch {
          path: proposal_path.to_path_buf(),
          expected: records.len(),
          actual: proposals.boxes.len(),
        });
      }
      for (record, boxes) in records.iter_mut().zip(proposals.boxes) {
        let limit = proposal_limit.unwrap_or(boxes.len());
        for bbox in boxes.into_iter().take(limit) {
          record.boxes.push(bbox);
          record.gt_classes.push(NO_GROUND_TRUTH);
        }
      }
    }

    Ok(JsonDataset {
      name: name.to_string(),
      records,
    })
  }
}
