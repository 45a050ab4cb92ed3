// 该文件是 Shanan （山南西风） 项目的一部分。
// src/partition.rs - 数据集索引区间划分
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

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 半开区间 `[start, end)`，描述分配给单个工作进程的图像索引范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexRange {
  pub start: usize,
  pub end: usize,
}

impl IndexRange {
  pub fn new(start: usize, end: usize) -> Self {
    Self { start, end }
  }

  pub fn len(&self) -> usize {
    self.end.saturating_sub(self.start)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// 局部索引到全局索引的映射
  pub fn global_index(&self, local: usize) -> usize {
    self.start + local
  }
}

impl fmt::Display for IndexRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}, {})", self.start, self.end)
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
  #[error("工作进程数量不能为 0")]
  NoWorkers,
  #[error("工作进程数量 {workers} 超过图像数量 {total}，会产生空区间")]
  TooManyWorkers { workers: usize, total: usize },
  #[error("无法解析索引区间: {0}")]
  Parse(String),
}

impl FromStr for IndexRange {
  type Err = PartitionError;

  /// 解析 `start,end` 或 `start..end` 形式的区间
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (start, end) = s
      .split_once("..")
      .or_else(|| s.split_once(','))
      .ok_or_else(|| PartitionError::Parse(s.to_string()))?;
    let start = start
      .trim()
      .parse()
      .map_err(|_| PartitionError::Parse(s.to_string()))?;
    let end = end
      .trim()
      .parse()
      .map_err(|_| PartitionError::Parse(s.to_string()))?;
    if end < start {
      return Err(PartitionError::Parse(s.to_string()));
    }
    Ok(IndexRange { start, end })
  }
}

/// 把 `[0, total)` 均衡地切分为 `workers` 个连续区间，余数分配给靠前的区间
pub fn partition(total: usize, workers: usize) -> Result<Vec<IndexRange>, PartitionError> {
  if workers == 0 {
    return Err(PartitionError::NoWorkers);
  }
  if workers > total {
    return Err(PartitionError::TooManyWorkers { workers, total });
  }

  let base = total / workers;
  let remainder = total % workers;
  let mut ranges = Vec::with_capacity(workers);
  let mut start = 0;
  for i in 0..workers {
    let len = base + usize::from(i < remainder);
    ranges.push(IndexRange::new(start, start + len));
    start += len;
  }
  debug_assert_eq!(start, total);
  Ok(ranges)
}
