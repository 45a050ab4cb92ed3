// 该文件是 Shanan （山南西风） 项目的一部分。
// src/calibrate/ema.rs - 最值的指数滑动平均
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

use super::TensorStatistics;

/// 对每张图像的最小值与最大值做滑动平均
///
/// 第一次观察直接作为初值，之后 `ema = alpha * ema + (1 - alpha) * cur`。
#[derive(Debug, Clone)]
pub struct EmaStatistics {
  alpha: f32,
  range: Option<(f32, f32)>,
}

impl EmaStatistics {
  pub fn new(alpha: f32) -> Self {
    Self {
      alpha: alpha.clamp(0.0, 1.0),
      range: None,
    }
  }
}

impl TensorStatistics for EmaStatistics {
  fn observe(&mut self, values: &[f32], _image: usize) {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let Some((min, max)) = finite.fold(None, |acc: Option<(f32, f32)>, v| match acc {
      None => Some((v, v)),
      Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    }) else {
      return;
    };

    self.range = Some(match self.range {
      None => (min, max),
      Some((ema_min, ema_max)) => (
        self.alpha * ema_min + (1.0 - self.alpha) * min,
        self.alpha * ema_max + (1.0 - self.alpha) * max,
      ),
    });
  }

  fn threshold(&self) -> Option<f32> {
    self.range.map(|(min, max)| min.abs().max(max.abs()))
  }
}
