// 该文件是 Shanan （山南西风） 项目的一部分。
// src/artifact.rs - 检测结果文件
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::detection::{BoxDetection, DetectionResults, DetectionSet, KeypointInstance, MaskRle};
use crate::partition::IndexRange;

pub const FULL_ARTIFACT: &str = "detections.pkl";

#[derive(Error, Debug)]
pub enum ArtifactError {
  #[error("结果文件 {path} 不存在")]
  Missing { path: PathBuf },
  #[error("读写结果文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("结果文件 {path} 编解码失败: {source}")]
  Codec {
    path: PathBuf,
    source: bincode::Error,
  },
  #[error("结果文件 {path} 的类别数为 {actual}，期望 {expected}")]
  ClassCountMismatch {
    path: PathBuf,
    expected: usize,
    actual: usize,
  },
}

/// 结果文件名：全量推理为 `detections.pkl`，区间推理为 `detection_range_<s>_<e>.pkl`
pub fn artifact_name(range: Option<IndexRange>) -> String {
  match range {
    Some(range) => format!("detection_range_{}_{}.pkl", range.start, range.end),
    None => FULL_ARTIFACT.to_string(),
  }
}

pub fn artifact_path(output_dir: &Path, range: Option<IndexRange>) -> PathBuf {
  output_dir.join(artifact_name(range))
}

/// 持久化的检测结果，附带生成时的配置快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultArtifact {
  pub all_boxes: DetectionSet<BoxDetection>,
  pub all_segms: DetectionSet<MaskRle>,
  pub all_keyps: DetectionSet<KeypointInstance>,
  pub cfg: String,
  pub created: DateTime<Utc>,
}

impl ResultArtifact {
  pub fn new(results: DetectionResults, cfg: String) -> Self {
    Self {
      all_boxes: results.all_boxes,
      all_segms: results.all_segms,
      all_keyps: results.all_keyps,
      cfg,
      created: Utc::now(),
    }
  }

  pub fn results(&self) -> DetectionResults {
    DetectionResults {
      all_boxes: self.all_boxes.clone(),
      all_segms: self.all_segms.clone(),
      all_keyps: self.all_keyps.clone(),
    }
  }

  pub fn into_results(self) -> DetectionResults {
    DetectionResults {
      all_boxes: self.all_boxes,
      all_segms: self.all_segms,
      all_keyps: self.all_keyps,
    }
  }

  pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
    let bytes = bincode::serialize(self).map_err(|source| ArtifactError::Codec {
      path: path.to_path_buf(),
      source,
    })?;
    std::fs::write(path, bytes).map_err(|source| ArtifactError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    info!("检测结果已写入 {}", path.display());
    Ok(())
  }

  pub fn load(path: &Path) -> Result<Self, ArtifactError> {
    if !path.is_file() {
      return Err(ArtifactError::Missing {
        path: path.to_path_buf(),
      });
    }
    let bytes = std::fs::read(path).map_err(|source| ArtifactError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    bincode::deserialize(&bytes).map_err(|source| ArtifactError::Codec {
      path: path.to_path_buf(),
      source,
    })
  }

  /// 读取工作进程的结果并检查类别数
  pub fn load_checked(path: &Path, num_classes: usize) -> Result<Self, ArtifactError> {
    let artifact = Self::load(path)?;
    for actual in [
      artifact.all_boxes.num_classes(),
      artifact.all_segms.num_classes(),
      artifact.all_keyps.num_classes(),
    ] {
      if actual != num_classes {
        return Err(ArtifactError::ClassCountMismatch {
          path: path.to_path_buf(),
          expected: num_classes,
          actual,
        });
      }
    }
    Ok(artifact)
  }
}
