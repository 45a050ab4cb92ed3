// 该文件是 Shanan （山南西风） 项目的一部分。
// src/calibrate/absmax.rs - 绝对值最大值统计
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

use super::{TensorStatistics, abs_max};

/// 记录所有图像上的最大绝对值
#[derive(Debug, Clone, Default)]
pub struct AbsmaxStatistics {
  max_abs: f32,
  observed: bool,
}

impl TensorStatistics for AbsmaxStatistics {
  fn observe(&mut self, values: &[f32], _image: usize) {
    if values.is_empty() {
      return;
    }
    self.max_abs = self.max_abs.max(abs_max(values));
    self.observed = true;
  }

  fn threshold(&self) -> Option<f32> {
    self.observed.then_some(self.max_abs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tracks_largest_magnitude() {
    let mut stats = AbsmaxStatistics::default();
    assert_eq!(stats.threshold(), None);
    stats.observe(&[0.5, -3.0], 0);
    stats.observe(&[2.0], 1);
    stats.observe(&[], 2);
    assert_eq!(stats.threshold(), Some(3.0));
  }
}
