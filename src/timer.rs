// 该文件是 Shanan （山南西风） 项目的一部分。
// src/timer.rs - 分阶段计时器
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
use std::time::{Duration, Instant};

pub const IM_DETECT_BBOX: &str = "im_detect_bbox";
pub const IM_DETECT_MASK: &str = "im_detect_mask";
pub const IM_DETECT_KEYPOINTS: &str = "im_detect_keypoints";
pub const MISC_BBOX: &str = "misc_bbox";
pub const MISC_MASK: &str = "misc_mask";
pub const MISC_KEYPOINTS: &str = "misc_keypoints";

pub const DETECT_STAGES: [&str; 3] = [IM_DETECT_BBOX, IM_DETECT_MASK, IM_DETECT_KEYPOINTS];
pub const MISC_STAGES: [&str; 3] = [MISC_BBOX, MISC_MASK, MISC_KEYPOINTS];

#[derive(Debug, Default, Clone)]
pub struct Timer {
  total: Duration,
  calls: u32,
  started: Option<Instant>,
}

impl Timer {
  pub fn tic(&mut self) {
    self.started = Some(Instant::now());
  }

  /// 结束一次计时并返回本次耗时；未调用 `tic` 时返回 0
  pub fn toc(&mut self) -> Duration {
    match self.started.take() {
      Some(started) => {
        let elapsed = started.elapsed();
        self.add(elapsed);
        elapsed
      }
      None => Duration::ZERO,
    }
  }

  pub fn add(&mut self, elapsed: Duration) {
    self.total += elapsed;
    self.calls += 1;
  }

  pub fn calls(&self) -> u32 {
    self.calls
  }

  pub fn total(&self) -> Duration {
    self.total
  }

  pub fn average(&self) -> Duration {
    if self.calls == 0 {
      Duration::ZERO
    } else {
      self.total / self.calls
    }
  }
}

/// 按名称索引的计时器集合，首次访问时自动创建
#[derive(Debug, Default, Clone)]
pub struct Timers {
  timers: BTreeMap<String, Timer>,
}

impl Timers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn timer(&mut self, name: &str) -> &mut Timer {
    self.timers.entry(name.to_string()).or_default()
  }

  pub fn tic(&mut self, name: &str) {
    self.timer(name).tic();
  }

  pub fn toc(&mut self, name: &str) -> Duration {
    self.timer(name).toc()
  }

  pub fn average(&self, name: &str) -> Duration {
    self.timers.get(name).map(Timer::average).unwrap_or_default()
  }

  /// 所有计时器平均耗时之和，即单张图像的平均总耗时
  pub fn average_total(&self) -> Duration {
    self.timers.values().map(Timer::average).sum()
  }

  pub fn sum_of(&self, names: &[&str]) -> Duration {
    names.iter().map(|name| self.average(name)).sum()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Timer)> {
    self.timers.iter().map(|(name, timer)| (name.as_str(), timer))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn average_over_calls() {
    let mut timer = Timer::default();
    timer.add(Duration::from_millis(10));
    timer.add(Duration::from_millis(30));
    assert_eq!(timer.calls(), 2);
    assert_eq!(timer.average(), Duration::from_millis(20));
  }

  #[test]
  fn toc_without_tic_is_ignored() {
    let mut timer = Timer::default();
    assert_eq!(timer.toc(), Duration::ZERO);
    assert_eq!(timer.calls(), 0);
  }

  #[test]
  fn stage_sums() {
    let mut timers = Timers::new();
    timers.timer(IM_DETECT_BBOX).add(Duration::from_millis(40));
    timers.timer(IM_DETECT_MASK).add(Duration::from_millis(20));
    timers.timer(MISC_BBOX).add(Duration::from_millis(5));

    assert_eq!(timers.sum_of(&DETECT_STAGES), Duration::from_millis(60));
    assert_eq!(timers.sum_of(&MISC_STAGES), Duration::from_millis(5));
    assert_eq!(timers.average_total(), Duration::from_millis(65));
  }
}
