// 该文件是 Shanan （山南西风） 项目的一部分。
// src/orchestrator.rs - 多设备推理调度与结果合并
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

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;

use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::{ArtifactError, ResultArtifact, artifact_name, artifact_path};
use crate::config::{Config, ConfigError};
use crate::dataset::{DatasetError, DatasetProvider};
use crate::detection::{DetectionResults, DetectionSetError};
use crate::evaluate::{Evaluator, Metrics, check_expected, log_copy_paste_friendly};
use crate::model::ModelLoader;
use crate::partition::{IndexRange, partition};
use crate::worker::{WorkerError, WorkerJob, test_net};

mod pool;
pub use self::pool::{
  LaunchError, WORKER_BINARY, WorkerPool, WorkerSpec, install_interrupt_handler,
  locate_worker_binary,
};

/// 写给工作进程的配置文件名
pub const WORKER_CONFIG: &str = "worker_config.json";

#[derive(Error, Debug)]
pub enum OrchestratorError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Dataset(#[from] DatasetError),
  #[error(transparent)]
  Worker(#[from] WorkerError),
  #[error(transparent)]
  Launch(#[from] LaunchError),
  #[error("合并工作进程结果失败: {0}")]
  Artifact(#[from] ArtifactError),
  #[error("合并工作进程结果失败: {0}")]
  Merge(#[from] DetectionSetError),
  #[error("评估失败: {0}")]
  Evaluation(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
  #[error("创建目录 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
}

/// 一次批量推理的参数
#[derive(Debug, Default)]
pub struct RunOptions {
  pub weights: PathBuf,
  pub multi_device: bool,
  pub device_count: usize,
  /// 是否在推理完成后评估结果
  pub evaluate: bool,
  pub interrupt: Option<Receiver<()>>,
}

#[derive(Debug)]
pub struct DatasetRun {
  pub dataset: String,
  pub results: DetectionResults,
  pub artifact: PathBuf,
}

#[derive(Debug)]
pub struct RunSummary {
  pub runs: Vec<DatasetRun>,
  pub metrics: Metrics,
  /// 期望值校验结果，不影响运行是否成功
  pub expected_ok: bool,
}

/// 对配置中的每个数据集执行推理，保存合并后的结果并评估
pub fn run_inference<L, P, E>(
  config: &Config,
  loader: &L,
  provider: &P,
  evaluator: &E,
  options: &RunOptions,
) -> Result<RunSummary, OrchestratorError>
where
  L: ModelLoader,
  P: DatasetProvider,
  E: Evaluator,
{
  config.ensure_generic_inference()?;
  if options.multi_device && config.quantization.calibrate {
    // 各工作进程只看到自己的区间，却写同一组 int8 子图
    return Err(
      ConfigError::PartialCalibration(format!("多设备模式 ({} 个设备) 不支持", options.device_count)).into(),
    );
  }
  if config.test.datasets.is_empty() {
    warn!("配置中没有任何数据集");
  }

  let mut runs = Vec::with_capacity(config.test.datasets.len());
  let mut metrics = Metrics::new();
  for index in 0..config.test.datasets.len() {
    let job = WorkerJob::from_config(config, index, true, &options.weights, None, 0)?;
    info!("开始处理数据集 {} ({}/{})", job.dataset, index + 1, config.test.datasets.len());

    let (results, artifact) = if options.multi_device {
      multi_device_inference(config, provider, &job, options)?
    } else {
      let output = test_net(config, loader, provider, &job)?;
      (output.results, output.artifact)
    };

    if options.evaluate {
      let dataset = provider.open(
        &job.dataset,
        job.proposal_file.as_deref(),
        config.test.proposal_limit,
      )?;
      let dataset_metrics = evaluator
        .evaluate(&dataset, &results, &job.output_dir)
        .map_err(|e| OrchestratorError::Evaluation(Box::new(e)))?;
      metrics.extend(dataset_metrics);
    }

    runs.push(DatasetRun {
      dataset: job.dataset,
      results,
      artifact,
    });
  }

  log_copy_paste_friendly(&metrics);
  let expected_ok = check_expected(&metrics, &config.expected_results);
  Ok(RunSummary {
    runs,
    metrics,
    expected_ok,
  })
}

/// 工作进程的命令行参数
pub fn worker_args(
  config_path: &Path,
  job: &WorkerJob,
  range: IndexRange,
  device: usize,
) -> Vec<OsString> {
  let mut args: Vec<OsString> = vec![
    "--config".into(),
    config_path.into(),
    "--dataset".into(),
    job.dataset.clone().into(),
    "--weights".into(),
    job.weights.clone().into(),
  ];
  if let Some(proposal_file) = &job.proposal_file {
    args.push("--proposal-file".into());
    args.push(proposal_file.into());
  }
  args.push("--range".into());
  args.push(format!("{},{}", range.start, range.end).into());
  args.push("--device".into());
  args.push(device.to_string().into());
  args
}

fn multi_device_inference<P: DatasetProvider>(
  config: &Config,
  provider: &P,
  job: &WorkerJob,
  options: &RunOptions,
) -> Result<(DetectionResults, PathBuf), OrchestratorError> {
  let total = provider.record_count(&job.dataset)?;
  let ranges = partition(total, options.device_count).map_err(ConfigError::from)?;

  std::fs::create_dir_all(&job.output_dir).map_err(|source| OrchestratorError::Io {
    path: job.output_dir.clone(),
    source,
  })?;
  let worker_config = config
    .clone()
    .for_worker(job.dataset.clone(), job.proposal_file.clone());
  worker_config.validate()?;
  let config_path = job.output_dir.join(WORKER_CONFIG);
  worker_config.save(&config_path)?;

  let binary = locate_worker_binary(config)?;
  info!(
    "使用 {} 个工作进程处理 {} 张图像: {}",
    ranges.len(),
    total,
    binary.display()
  );

  let mut pool = WorkerPool::new(
    &binary,
    config.workers.timeout(),
    config.workers.poll_interval(),
  )
  .with_interrupt(options.interrupt.as_ref());
  for (device, range) in ranges.iter().enumerate() {
    let range = *range;
    let log_name = format!("detection_range_{}_{}.log", range.start, range.end);
    pool.launch(WorkerSpec {
      range,
      device,
      args: worker_args(&config_path, job, range, device),
      log_path: job.output_dir.join(log_name),
      artifact: artifact_path(&job.output_dir, Some(range)),
    })?;
  }
  let finished = pool.wait_all()?;

  let mut partials = Vec::with_capacity(finished.len());
  for (range, path) in finished {
    let artifact = ResultArtifact::load_checked(&path, config.model.num_classes)?;
    info!("读取区间 {} 的结果: {}", range, path.display());
    partials.push((range, artifact.into_results()));
  }
  let merged = DetectionResults::merge(config.model.num_classes, total, partials)?;

  let path = job.output_dir.join(artifact_name(None));
  ResultArtifact::new(merged.clone(), config.snapshot()).save(&path)?;
  Ok((merged, path))
}
