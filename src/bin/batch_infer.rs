// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/batch_infer.rs - 批量推理入口
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use shanan_batch::{
  config::{CalibrationStrategy, Config},
  dataset::JsonDatasetProvider,
  evaluate::DetectionSummary,
  model::ReplayLoader,
  orchestrator::{RunOptions, install_interrupt_handler, run_inference},
};

/// 在一个或多个设备上对数据集执行批量检测推理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件路径 (JSON)
  #[arg(long, value_name = "CONFIG")]
  pub config: PathBuf,
  /// 模型录制文件路径，或 replay:///path?dump=DIR
  #[arg(long, value_name = "WEIGHTS")]
  pub weights: PathBuf,
  /// 按设备数启动多个工作进程
  #[arg(long)]
  pub multi_device: bool,
  #[arg(long, value_name = "N", default_value_t = 1)]
  pub device_count: usize,
  /// 跳过结果评估
  #[arg(long)]
  pub skip_evaluation: bool,
  /// 推理结束后按指定策略校准并输出 int8 子图
  #[arg(long, value_enum, value_name = "STRATEGY")]
  pub calibrate: Option<CalibrationStrategy>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("配置文件: {}", args.config.display());
  info!("模型: {}", args.weights.display());

  let mut config = Config::load(&args.config)?;
  if let Some(strategy) = args.calibrate {
    config.quantization.calibrate = true;
    config.quantization.strategy = strategy;
  }
  config.validate()?;
  let config = config;

  let interrupt = if args.multi_device {
    info!("多设备模式: {} 个设备", args.device_count);
    Some(install_interrupt_handler()?)
  } else {
    None
  };

  let dump_dir = config
    .runtime
    .debug_name_ops
    .then(|| config.output_root.clone());
  let loader = ReplayLoader::from_weights(&args.weights, dump_dir)?;
  let provider = JsonDatasetProvider::new(&config.dataset_root);
  let options = RunOptions {
    weights: args.weights.clone(),
    multi_device: args.multi_device,
    device_count: args.device_count,
    evaluate: !args.skip_evaluation,
    interrupt,
  };

  let summary = run_inference(&config, &loader, &provider, &DetectionSummary, &options)?;
  for run in &summary.runs {
    info!(
      "数据集 {}: {} 张图像，结果 {}",
      run.dataset,
      run.results.num_images(),
      run.artifact.display()
    );
  }
  if !summary.expected_ok {
    warn!("部分指标偏离期望值");
  }

  Ok(())
}
