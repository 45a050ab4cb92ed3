// 该文件是 Shanan （山南西风） 项目的一部分。
// src/calibrate/kl.rs - 基于 KL 散度的阈值搜索
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

//! 两阶段统计：前 `range_images` 张图像确定绝对值范围，
//! 其后的图像把 `|x|` 填入该范围上的直方图，最后搜索使量化前后分布
//! KL 散度最小的截断阈值。

use super::{TensorStatistics, abs_max};

/// 量化后的级数（不含符号位）
pub const QUANTIZED_BINS: usize = 128;

const EPSILON: f64 = 1e-4;

#[derive(Debug, Clone)]
pub struct KlStatistics {
  range_images: usize,
  max_abs: f32,
  observed: bool,
  histogram: Vec<u64>,
  /// 直方图覆盖 `[0, hist_range]`，首次进入直方图阶段时固定
  hist_range: f32,
}

impl KlStatistics {
  pub fn new(range_images: usize, bins: usize) -> Self {
    Self {
      range_images,
      max_abs: 0.0,
      observed: false,
      histogram: vec![0; bins.max(QUANTIZED_BINS)],
      hist_range: 0.0,
    }
  }

  pub fn histogram(&self) -> &[u64] {
    &self.histogram
  }

  fn fill(&mut self, values: &[f32]) {
    if self.hist_range <= 0.0 {
      // 该张量在范围阶段没有出现，用当前图像补上
      self.hist_range = self.max_abs.max(abs_max(values));
    }
    let bins = self.histogram.len();
    let last = bins - 1;
    for v in values.iter().filter(|v| v.is_finite()) {
      let index = if self.hist_range > 0.0 {
        ((v.abs() / self.hist_range * bins as f32) as usize).min(last)
      } else {
        0
      };
      self.histogram[index] += 1;
    }
  }
}

impl TensorStatistics for KlStatistics {
  fn observe(&mut self, values: &[f32], image: usize) {
    if values.is_empty() {
      return;
    }
    self.observed = true;
    if image < self.range_images {
      self.max_abs = self.max_abs.max(abs_max(values));
    } else {
      self.fill(values);
    }
  }

  fn threshold(&self) -> Option<f32> {
    if !self.observed {
      return None;
    }
    if self.histogram.iter().all(|&c| c == 0) || self.hist_range <= 0.0 {
      // 没有直方图阶段的数据，退化为绝对值最大值
      return Some(self.max_abs.max(self.hist_range));
    }
    let bin_width = self.hist_range / self.histogram.len() as f32;
    let best = kl_threshold(&self.histogram, QUANTIZED_BINS);
    Some(((best as f32 + 0.5) * bin_width).min(self.hist_range))
  }
}

/// 在直方图上搜索截断位置，返回 KL 散度最小的保留桶数
///
/// 候选 `i` 从 `target_bins` 到直方图长度，超出部分并入第 `i - 1` 桶作为参考分布；
/// 前 `i` 桶合并为 `target_bins` 级再按非零桶展开作为量化分布。
pub fn kl_threshold(histogram: &[u64], target_bins: usize) -> usize {
  let bins = histogram.len();
  if bins <= target_bins {
    return bins;
  }

  let mut best = bins;
  let mut best_divergence = f64::INFINITY;
  let mut reference = vec![0f64; bins];
  let mut candidate = vec![0f64; bins];

  for i in target_bins..=bins {
    let outliers: u64 = histogram[i..].iter().sum();
    for (p, &count) in reference[..i].iter_mut().zip(&histogram[..i]) {
      *p = count as f64;
    }
    reference[i - 1] += outliers as f64;

    let merge = i as f64 / target_bins as f64;
    for j in 0..target_bins {
      let start = (j as f64 * merge).floor() as usize;
      let end = if j + 1 == target_bins {
        i
      } else {
        ((j + 1) as f64 * merge).floor() as usize
      };
      let chunk = &histogram[start..end];
      let nonzero = chunk.iter().filter(|&&c| c > 0).count();
      let average = if nonzero > 0 {
        chunk.iter().sum::<u64>() as f64 / nonzero as f64
      } else {
        0.0
      };
      for (q, &count) in candidate[start..end].iter_mut().zip(chunk) {
        *q = if count > 0 { average } else { 0.0 };
      }
    }

    let divergence = kl_divergence(&reference[..i], &candidate[..i]);
    if divergence < best_divergence {
      best_divergence = divergence;
      best = i;
    }
  }
  best
}

fn kl_divergence(reference: &[f64], candidate: &[f64]) -> f64 {
  let p_sum: f64 = reference.iter().sum();
  let q_sum: f64 = candidate.iter().sum();
  if p_sum <= 0.0 {
    return 0.0;
  }
  reference
    .iter()
    .zip(candidate)
    .filter(|(p, _)| **p > 0.0)
    .map(|(p, q)| {
      let p = p / p_sum;
      let q = if *q > 0.0 && q_sum > 0.0 {
        q / q_sum
      } else {
        EPSILON
      };
      p * (p / q).ln()
    })
    .sum()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn falls_back_to_absmax_without_histogram() {
    let mut stats = KlStatistics::new(4, 2048);
    assert_eq!(stats.threshold(), None);
    stats.observe(&[1.0, -6.0], 0);
    stats.observe(&[2.0], 1);
    assert_eq!(stats.threshold(), Some(6.0));
  }

  #[test]
  fn histogram_clamps_overflow_into_last_bin() {
    let mut stats = KlStatistics::new(1, 2048);
    stats.observe(&[4.0], 0);
    stats.observe(&[0.0, 1.0, 100.0], 1);
    let histogram = stats.histogram();
    assert_eq!(histogram[0], 1);
    assert_eq!(histogram[512], 1);
    assert_eq!(histogram[2047], 1);
    assert_eq!(histogram.iter().sum::<u64>(), 3);
  }

  #[test]
  fn dense_distribution_keeps_full_range() {
    let mut stats = KlStatistics::new(1, 2048);
    stats.observe(&[10.0], 0);
    let values: Vec<f32> = (0..200_000).map(|k| k as f32 / 20_000.0).collect();
    stats.observe(&values, 1);
    let threshold = stats.threshold().unwrap();
    assert!(threshold > 9.0 && threshold <= 10.0, "{}", threshold);
  }

  #[test]
  fn threshold_never_exceeds_range() {
    let mut stats = KlStatistics::new(1, 2048);
    stats.observe(&[8.0], 0);
    let values: Vec<f32> = (0..5_000).map(|k| ((k * 7919) % 1000) as f32 / 1000.0).collect();
    stats.observe(&values, 1);
    stats.observe(&[8.0, -7.5], 2);
    let threshold = stats.threshold().unwrap();
    assert!(threshold > 0.0 && threshold <= 8.0, "{}", threshold);
  }

  #[test]
  fn search_covers_whole_candidate_range() {
    let histogram = vec![1u64; 256];
    let best = kl_threshold(&histogram, 128);
    assert!((128..=256).contains(&best));
    assert_eq!(kl_threshold(&[3, 1], 128), 2);
  }
}
