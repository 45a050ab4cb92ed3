// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/test_net.rs - 单设备推理工作进程
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
use tracing::info;

use shanan_batch::{
  config::{CalibrationStrategy, Config},
  dataset::JsonDatasetProvider,
  model::ReplayLoader,
  partition::IndexRange,
  worker::{WorkerJob, test_net},
};

/// 在单个设备上对一个数据集（或其子区间）执行推理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件路径 (JSON)
  #[arg(long, value_name = "CONFIG")]
  pub config: PathBuf,
  /// 数据集名称，覆盖配置文件
  #[arg(long, value_name = "DATASET")]
  pub dataset: Option<String>,
  /// 预计算候选框文件，覆盖配置文件
  #[arg(long, value_name = "PROPOSAL_FILE")]
  pub proposal_file: Option<PathBuf>,
  /// 模型录制文件路径，或 replay:///path?dump=DIR
  #[arg(long, value_name = "WEIGHTS")]
  pub weights: PathBuf,
  /// 处理的图像区间 `start,end`，缺省为整个数据集
  #[arg(long, value_name = "RANGE")]
  pub range: Option<IndexRange>,
  #[arg(long, value_name = "DEVICE", default_value_t = 0)]
  pub device: usize,
  /// 推理结束后按指定策略校准并输出 int8 子图
  #[arg(long, value_enum, value_name = "STRATEGY")]
  pub calibrate: Option<CalibrationStrategy>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let mut config = Config::load(&args.config)?;
  if let Some(dataset) = args.dataset {
    let proposal_file = args
      .proposal_file
      .or_else(|| config.test.proposal_files.first().cloned());
    config = config.for_worker(dataset, proposal_file);
  }
  if let Some(strategy) = args.calibrate {
    config.quantization.calibrate = true;
    config.quantization.strategy = strategy;
  }
  config.validate()?;
  let config = config;

  let job = WorkerJob::from_config(&config, 0, false, &args.weights, args.range, args.device)?;
  info!(
    "数据集 {} 设备 {} 区间 {}",
    job.dataset,
    job.device,
    job
      .range
      .map(|r| r.to_string())
      .unwrap_or_else(|| "全部".to_string())
  );

  let dump_dir = config.runtime.debug_name_ops.then(|| job.output_dir.clone());
  let loader = ReplayLoader::from_weights(&args.weights, dump_dir)?;
  let provider = JsonDatasetProvider::new(&config.dataset_root);
  let output = test_net(&config, &loader, &provider, &job)?;

  info!(
    "完成 {} 张图像 (区间 {}，共 {} 张)，结果写入 {}",
    output.results.num_images(),
    output.range,
    output.total_images,
    output.artifact.display()
  );
  for path in &output.int8_graphs {
    info!("int8 子图: {}", path.display());
  }
  Ok(())
}
