// 该文件是 Shanan （山南西风） 项目的一部分。
// src/worker.rs - 单设备推理循环
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

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactError, ResultArtifact, artifact_path};
use crate::calibrate::{CalibrationError, Calibrator};
use crate::config::{Config, ConfigError};
use crate::dataset::{
  Dataset, DatasetError, DatasetProvider, ImageRecord, extend_for_calibration, select_range,
};
use crate::detection::{DetectionResults, DetectionSetError, ImageDetections};
use crate::graph::{GraphError, int8_graph_paths};
use crate::model::{
  Capabilities, InferenceObserver, LoadOptions, Model, ModelLoader, NetRole, NoObserver, Observers,
};
use crate::partition::IndexRange;
use crate::progress::{NetProfiler, ProgressReporter};
use crate::timer::Timers;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Dataset(#[from] DatasetError),
  #[error("模型错误: {0}")]
  Model(#[source] BoxError),
  #[error(transparent)]
  Detection(#[from] DetectionSetError),
  #[error(transparent)]
  Calibration(#[from] CalibrationError),
  #[error(transparent)]
  Graph(#[from] GraphError),
  #[error(transparent)]
  Artifact(#[from] ArtifactError),
  #[error("创建目录 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
}

fn model_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> WorkerError {
  WorkerError::Model(Box::new(e))
}

/// 一次推理任务的输入
#[derive(Debug, Clone)]
pub struct WorkerJob {
  pub weights: PathBuf,
  pub dataset: String,
  pub proposal_file: Option<PathBuf>,
  /// 为 `None` 时处理整个数据集
  pub range: Option<IndexRange>,
  pub device: usize,
  pub output_dir: PathBuf,
}

impl WorkerJob {
  /// 从已冻结的配置中取出第 `index` 个数据集
  pub fn from_config(
    config: &Config,
    index: usize,
    is_parent: bool,
    weights: &Path,
    range: Option<IndexRange>,
    device: usize,
  ) -> Result<Self, ConfigError> {
    let (dataset, proposal_file) = config.inference_dataset(index, is_parent)?;
    let output_dir = config.output_dir(&dataset);
    Ok(Self {
      weights: weights.to_path_buf(),
      dataset,
      proposal_file,
      range,
      device,
      output_dir,
    })
  }
}

#[derive(Debug)]
pub struct WorkerOutput {
  pub results: DetectionResults,
  pub range: IndexRange,
  pub total_images: usize,
  pub artifact: PathBuf,
  /// 校准后写出的 int8 子图
  pub int8_graphs: Vec<PathBuf>,
}

fn create_dir(path: &Path) -> Result<(), WorkerError> {
  std::fs::create_dir_all(path).map_err(|source| WorkerError::Io {
    path: path.to_path_buf(),
    source,
  })
}

/// 在一个设备上对数据集（或其子区间）执行推理并保存结果
pub fn test_net<L, P>(
  config: &Config,
  loader: &L,
  provider: &P,
  job: &WorkerJob,
) -> Result<WorkerOutput, WorkerError>
where
  L: ModelLoader,
  P: DatasetProvider,
{
  config.ensure_generic_inference()?;
  if config.test.precomputed_proposals && job.proposal_file.is_none() {
    return Err(DatasetError::MissingProposalFile.into());
  }

  let dataset = provider.open(
    &job.dataset,
    job.proposal_file.as_deref(),
    config.test.proposal_limit,
  )?;
  let (mut records, range, total_images) = select_range(dataset.records(), job.range)?;
  info!(
    "数据集 {}: 处理区间 {} (共 {} 张)",
    dataset.name(),
    range,
    total_images
  );
  if config.quantization.calibrate && range.len() != total_images {
    return Err(
      ConfigError::PartialCalibration(format!("当前只处理区间 {} (共 {} 张)", range, total_images)).into(),
    );
  }
  create_dir(&job.output_dir)?;

  let model = loader
    .load(&job.weights, &LoadOptions::primary(job.device), config)
    .map_err(model_error)?;
  let reference = if config.runtime.cosim {
    warn!("启用协同仿真，加载浮点参考模型");
    Some(
      loader
        .load(&job.weights, &LoadOptions::reference(job.device), config)
        .map_err(model_error)?,
    )
  } else {
    None
  };

  let caps = model.capabilities();
  if caps.proposals_only {
    return Err(ConfigError::ProposalOnlyModel.into());
  }
  let outputs = Capabilities {
    masks: caps.masks && config.model.mask_on,
    keypoints: caps.keypoints && config.model.keypoints_on,
    proposals_only: false,
  };
  if config.model.mask_on && !caps.masks {
    warn!("配置要求输出掩码，但模型不支持");
  }
  if config.model.keypoints_on && !caps.keypoints {
    warn!("配置要求输出关键点，但模型不支持");
  }

  let num_images = range.len();
  let mut calibrator = config
    .quantization
    .calibrate
    .then(|| Calibrator::new(&config.quantization));
  if let Some(required) = config.quantization.calibration_records() {
    extend_for_calibration(&mut records, required);
  }

  let mut profiler = config.runtime.profile.then(NetProfiler::new);
  let reporter = ProgressReporter::new(range, total_images, config.log_interval);
  let mut pass = InferencePass {
    config,
    model: &model,
    reference: reference.as_ref(),
    outputs,
    reporter: &reporter,
    calibrator: calibrator.as_mut(),
    profiler: profiler.as_mut(),
  };

  if config.runtime.warmup_pass {
    info!("预热：完整执行一遍推理，结果丢弃");
    let mut discarded = DetectionResults::empty(config.model.num_classes, num_images);
    pass.run(&records, &mut discarded, &mut Timers::new())?;
  }

  let mut results = DetectionResults::empty(config.model.num_classes, num_images);
  let mut timers = Timers::new();
  pass.run(&records, &mut results, &mut timers)?;

  let int8_graphs = match calibrator.as_mut() {
    Some(calibrator) => write_int8_graphs(config, calibrator, &model, &job.output_dir)?,
    None => Vec::new(),
  };

  let artifact = artifact_path(&job.output_dir, job.range);
  ResultArtifact::new(results.clone(), config.snapshot()).save(&artifact)?;

  Ok(WorkerOutput {
    results,
    range,
    total_images,
    artifact,
    int8_graphs,
  })
}

struct InferencePass<'a, M: Model> {
  config: &'a Config,
  model: &'a M,
  reference: Option<&'a M>,
  outputs: Capabilities,
  reporter: &'a ProgressReporter,
  calibrator: Option<&'a mut Calibrator>,
  profiler: Option<&'a mut NetProfiler>,
}

impl<M: Model> InferencePass<'_, M> {
  /// 依次处理每条记录；超出结果区间的记录只用于校准
  fn run(
    &mut self,
    records: &[ImageRecord],
    results: &mut DetectionResults,
    timers: &mut Timers,
  ) -> Result<(), WorkerError> {
    let num_images = results.num_images();
    for (i, record) in records.iter().enumerate() {
      let proposals = if self.config.test.precomputed_proposals {
        let proposals = record.non_gt_proposals();
        if proposals.is_empty() {
          debug!("{} 没有可用的候选框，跳过", record.image.display());
          continue;
        }
        Some(proposals)
      } else {
        None
      };

      let detections = self.infer(record, proposals.as_deref(), timers)?;

      if let Some(reference) = self.reference {
        let expected = reference
          .infer(record, proposals.as_deref(), &mut Timers::new(), &mut NoObserver)
          .map_err(model_error)?;
        compare_cosim(record, &expected, &detections);
      }
      if let Some(profiler) = self.profiler.as_deref() {
        profiler.log();
      }

      if i < num_images {
        results.extend(i, self.strip(detections))?;
        self.reporter.report(i, timers);
      }
    }
    Ok(())
  }

  fn infer(
    &mut self,
    record: &ImageRecord,
    proposals: Option<&[[f32; 4]]>,
    timers: &mut Timers,
  ) -> Result<ImageDetections, WorkerError> {
    if let Some(calibrator) = self.calibrator.as_deref_mut() {
      calibrator.begin_image();
    }
    let detections = {
      let mut observers = Observers::new()
        .with(
          self
            .calibrator
            .as_deref_mut()
            .map(|c| c as &mut dyn InferenceObserver),
        )
        .with(
          self
            .profiler
            .as_deref_mut()
            .map(|p| p as &mut dyn InferenceObserver),
        );
      self.model.infer(record, proposals, timers, &mut observers)
    };
    if let Some(calibrator) = self.calibrator.as_deref_mut() {
      calibrator.end_image();
    }
    detections.map_err(model_error)
  }

  fn strip(&self, mut detections: ImageDetections) -> ImageDetections {
    if !self.outputs.masks {
      detections.segms = None;
    }
    if !self.outputs.keypoints {
      detections.keyps = None;
    }
    detections
  }
}

/// 对比量化模型与浮点参考模型的检测结果
fn compare_cosim(record: &ImageRecord, expected: &ImageDetections, actual: &ImageDetections) {
  let mut max_diff = 0f32;
  let mut mismatched = Vec::new();
  for (class, (a, b)) in expected.boxes.iter().zip(&actual.boxes).enumerate() {
    if a.len() != b.len() {
      mismatched.push(class);
      continue;
    }
    for (x, y) in a.iter().zip(b) {
      let diff = [
        x.x1 - y.x1,
        x.y1 - y.y1,
        x.x2 - y.x2,
        x.y2 - y.y2,
        x.score - y.score,
      ]
      .into_iter()
      .fold(0f32, |acc, d| acc.max(d.abs()));
      max_diff = max_diff.max(diff);
    }
  }

  if mismatched.is_empty() {
    info!(
      "协同仿真 {}: 最大偏差 {:.6}",
      record.image.display(),
      max_diff
    );
  } else {
    warn!(
      "协同仿真 {}: 类别 {:?} 的检测数量不一致，其余最大偏差 {:.6}",
      record.image.display(),
      mismatched,
      max_diff
    );
  }
}

/// 校准并写出每个子图的 int8 推理子图与初始化子图
fn write_int8_graphs<M: Model>(
  config: &Config,
  calibrator: &mut Calibrator,
  model: &M,
  output_dir: &Path,
) -> Result<Vec<PathBuf>, WorkerError> {
  warn!("推理结束，开始计算量化参数");
  calibrator.compute()?;

  let dir = config
    .quantization
    .output_dir
    .clone()
    .unwrap_or_else(|| output_dir.to_path_buf());
  create_dir(&dir)?;
  let format = config.quantization.graph_format();

  let mut written = Vec::new();
  for role in NetRole::ALL {
    let Some(net) = model.net(role) else {
      continue;
    };
    let Some(quantized) = calibrator.quantize(model.workspace(), net)? else {
      continue;
    };
    let (predict_path, init_path) = int8_graph_paths(&dir, &net.name, format);
    quantized.predict.save(&predict_path, format)?;
    quantized.init.save(&init_path, format)?;
    warn!(
      "子图 {} 的 int8 模型已写入 {} 与 {}",
      net.name,
      predict_path.display(),
      init_path.display()
    );
    written.push(predict_path);
    written.push(init_path);
  }
  Ok(written)
}
