// 该文件是 Shanan （山南西风） 项目的一部分。
// src/progress.rs - 推理进度、剩余时间估计与算子性能统计
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
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::model::InferenceObserver;
use crate::partition::IndexRange;
use crate::timer::{DETECT_STAGES, MISC_STAGES, Timer, Timers};

/// 一次进度汇报的快照
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
  /// 已完成的全局图像序号（从 1 开始）
  pub done: usize,
  pub last: usize,
  pub detect_time: Duration,
  pub misc_time: Duration,
  pub eta: Duration,
}

/// 周期性汇报推理进度
///
/// ETA = 单张图像平均总耗时 × 剩余图像数。
#[derive(Debug, Clone)]
pub struct ProgressReporter {
  range: IndexRange,
  total_images: usize,
  interval: usize,
}

impl ProgressReporter {
  pub fn new(range: IndexRange, total_images: usize, interval: usize) -> Self {
    Self {
      range,
      total_images,
      interval: interval.max(1),
    }
  }

  /// 第 `index` 张（区间内局部索引）图像处理完成后调用；未到汇报周期时返回 `None`
  pub fn report(&self, index: usize, timers: &Timers) -> Option<Progress> {
    if index % self.interval != 0 {
      return None;
    }

    let progress = self.snapshot(index, timers);
    info!(
      "im_detect: range [{}, {}] of {}: {}/{} {:.3}s + {:.3}s (eta: {})",
      self.range.start + 1,
      self.range.end,
      self.total_images,
      progress.done,
      progress.last,
      progress.detect_time.as_secs_f64(),
      progress.misc_time.as_secs_f64(),
      format_eta(progress.eta)
    );
    for (name, timer) in timers.iter() {
      debug!("{} : {:.3}s", name, timer.average().as_secs_f64());
    }
    Some(progress)
  }

  pub fn snapshot(&self, index: usize, timers: &Timers) -> Progress {
    let remaining = self.range.len().saturating_sub(index + 1);
    Progress {
      done: self.range.start + index + 1,
      last: self.range.end,
      detect_time: timers.sum_of(&DETECT_STAGES),
      misc_time: timers.sum_of(&MISC_STAGES),
      eta: timers.average_total() * remaining as u32,
    }
  }
}

/// 以 `H:MM:SS` 形式输出整秒时长
pub fn format_eta(eta: Duration) -> String {
  let secs = eta.as_secs();
  format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// 按子图统计算子耗时
#[derive(Debug, Default)]
pub struct NetProfiler {
  nets: BTreeMap<String, NetProfile>,
}

#[derive(Debug, Default)]
struct NetProfile {
  total: Timer,
  ops: BTreeMap<String, Timer>,
}

impl NetProfiler {
  pub fn new() -> Self {
    Self::default()
  }

  /// 子图单次运行的平均总耗时（所有算子之和）
  pub fn average_time(&self, net: &str) -> Option<Duration> {
    self.nets.get(net).map(|profile| {
      profile
        .ops
        .values()
        .map(Timer::average)
        .sum::<Duration>()
    })
  }

  /// 每个算子的平均耗时
  pub fn average_time_children(&self, net: &str) -> Vec<(String, Duration)> {
    self
      .nets
      .get(net)
      .map(|profile| {
        profile
          .ops
          .iter()
          .map(|(op, timer)| (op.clone(), timer.average()))
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn log(&self) {
    for (net, profile) in &self.nets {
      let average = self.average_time(net).unwrap_or_default();
      warn!(
        "子图 {} 观测耗时 = {:.3}ms ({} 次算子调用)",
        net,
        average.as_secs_f64() * 1000.0,
        profile.total.calls()
      );
      for (op, timer) in &profile.ops {
        warn!("  {} : {:.3}ms", op, timer.average().as_secs_f64() * 1000.0);
      }
    }
  }
}

impl InferenceObserver for NetProfiler {
  fn on_op_timing(&mut self, net: &str, op: &str, elapsed: Duration) {
    let profile = self.nets.entry(net.to_string()).or_default();
    profile.total.add(elapsed);
    profile.ops.entry(op.to_string()).or_default().add(elapsed);
  }
}
