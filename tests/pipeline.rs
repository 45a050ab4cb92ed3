// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/pipeline.rs - 推理流程集成测试
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

use shanan_batch::{
  artifact::{ArtifactError, ResultArtifact, artifact_path},
  config::{CalibrationStrategy, Config, ConfigError},
  dataset::{Dataset, DatasetError, DatasetProvider, ImageRecord, NO_GROUND_TRUTH},
  detection::{BoxDetection, DetectionResults, ImageDetections, MaskRle},
  evaluate::{DetectionSummary, TASK_BOX},
  graph::{ArgValue, Blob, GraphFormat, GraphPreparation, NetDef, OperatorDef, Tensor, Workspace, int8_graph_paths},
  model::{Capabilities, InferenceObserver, LoadOptions, Model, ModelLoader, NetRole},
  orchestrator::{LaunchError, OrchestratorError, RunOptions, WORKER_CONFIG, run_inference},
  partition::{IndexRange, partition},
  timer::{IM_DETECT_BBOX, Timers},
  worker::{WorkerError, WorkerJob, test_net},
};

const NUM_CLASSES: usize = 4;
const NET: &str = "mock_net";

/// 以图像序号决定输出的确定性模型
struct MockModel {
  caps: Capabilities,
  net: NetDef,
  workspace: Workspace,
}

fn image_index(record: &ImageRecord) -> usize {
  record
    .image
    .file_stem()
    .and_then(|s| s.to_str())
    .and_then(|s| s.strip_prefix("img"))
    .and_then(|s| s.parse().ok())
    .unwrap_or(0)
}

impl Model for MockModel {
  type Error = std::io::Error;

  fn capabilities(&self) -> Capabilities {
    self.caps
  }

  fn infer(
    &self,
    record: &ImageRecord,
    _proposals: Option<&[[f32; 4]]>,
    timers: &mut Timers,
    observer: &mut dyn InferenceObserver,
  ) -> Result<ImageDetections, Self::Error> {
    timers.tic(IM_DETECT_BBOX);
    let i = image_index(record);
    let x = i as f32;
    observer.on_activation(NET, "data", &[x - 3.0, 1.0, 0.5]);
    observer.on_activation(NET, "conv1", &[-x, 2.0 * x + 1.0]);
    observer.on_activation(NET, "relu1", &[0.0, 2.0 * x + 1.0]);

    let mut boxes = vec![Vec::new(); NUM_CLASSES];
    let mut segms = vec![Vec::new(); NUM_CLASSES];
    for class in 1..NUM_CLASSES {
      if (i + class) % 2 == 0 {
        let c = class as f32;
        boxes[class].push(BoxDetection::new([x, c, x + 1.0, c + 1.0], 0.5 + 0.125 * c));
        segms[class].push(MaskRle {
          size: [2, 2],
          counts: vec![i as u8, class as u8],
        });
      }
    }
    timers.toc(IM_DETECT_BBOX);

    Ok(ImageDetections {
      boxes,
      segms: self.caps.masks.then_some(segms),
      keyps: None,
    })
  }

  fn net(&self, role: NetRole) -> Option<&NetDef> {
    (role == NetRole::Detection).then_some(&self.net)
  }

  fn net_and_workspace_mut(&mut self, role: NetRole) -> Option<(&mut NetDef, &mut Workspace)> {
    (role == NetRole::Detection).then_some((&mut self.net, &mut self.workspace))
  }

  fn workspace(&self) -> &Workspace {
    &self.workspace
  }
}

struct MockLoader {
  caps: Capabilities,
}

impl MockLoader {
  fn new() -> Self {
    Self {
      caps: Capabilities {
        masks: true,
        ..Default::default()
      },
    }
  }
}

impl ModelLoader for MockLoader {
  type Model = MockModel;
  type Error = std::io::Error;

  fn load(&self, _weights: &Path, options: &LoadOptions, config: &Config) -> Result<MockModel, Self::Error> {
    let mut workspace = Workspace::new(&options.workspace);
    workspace.feed("w", Blob::Float(Tensor::new(vec![2], vec![0.25, -1.0])));
    workspace.feed("b", Blob::Float(Tensor::new(vec![1], vec![0.5])));
    let mut net = NetDef {
      name: NET.into(),
      ops: vec![
        OperatorDef::new("Conv", &["data", "w", "b"], &["conv1"]).with_arg("kernel", ArgValue::Int(1)),
        OperatorDef::new("Relu", &["conv1"], &["relu1"]),
      ],
      external_inputs: vec!["data".into()],
      external_outputs: vec!["relu1".into()],
    };
    GraphPreparation::from_config(config, options.int8, None)
      .prepare(&mut net, &mut workspace)
      .map_err(std::io::Error::other)?;
    Ok(MockModel {
      caps: self.caps,
      net,
      workspace,
    })
  }
}

struct MockDataset {
  records: Vec<ImageRecord>,
}

impl Dataset for MockDataset {
  fn name(&self) -> &str {
    "toy"
  }

  fn records(&self) -> &[ImageRecord] {
    &self.records
  }
}

struct MockProvider {
  records: Vec<ImageRecord>,
}

impl MockProvider {
  fn new(n: usize) -> Self {
    Self {
      records: (0..n).map(|i| ImageRecord::new(format!("img{}.jpg", i))).collect(),
    }
  }
}

impl DatasetProvider for MockProvider {
  type Dataset = MockDataset;

  fn open(
    &self,
    _name: &str,
    _proposal_file: Option<&Path>,
    _proposal_limit: Option<usize>,
  ) -> Result<MockDataset, DatasetError> {
    Ok(MockDataset {
      records: self.records.clone(),
    })
  }
}

fn config(root: &Path) -> Config {
  let mut config = Config::default();
  config.model.num_classes = NUM_CLASSES;
  config.model.mask_on = true;
  config.test.datasets = vec!["toy".into()];
  config.output_root = root.to_path_buf();
  config.log_interval = 2;
  config
}

fn job(config: &Config, range: Option<IndexRange>) -> WorkerJob {
  WorkerJob::from_config(config, 0, false, Path::new("weights.json"), range, 0).unwrap()
}

#[test]
fn ranged_workers_merge_to_single_process_result() {
  let dir = tempfile::tempdir().unwrap();
  let config = config(dir.path());
  let loader = MockLoader::new();
  let provider = MockProvider::new(10);

  let full = test_net(&config, &loader, &provider, &job(&config, None)).unwrap();
  assert_eq!(full.artifact, dir.path().join("test/toy/detections.pkl"));

  let ranges = partition(10, 3).unwrap();
  assert_eq!(
    ranges,
    vec![IndexRange::new(0, 4), IndexRange::new(4, 7), IndexRange::new(7, 10)]
  );

  let mut partials = Vec::new();
  for range in &ranges {
    let output = test_net(&config, &loader, &provider, &job(&config, Some(*range))).unwrap();
    assert_eq!(output.results.num_images(), range.len());
    assert_eq!(
      output.artifact,
      artifact_path(&config.output_dir("toy"), Some(*range))
    );
    let artifact = ResultArtifact::load_checked(&output.artifact, NUM_CLASSES).unwrap();
    partials.push((*range, artifact.into_results()));
  }

  let mut reversed = partials.clone();
  reversed.reverse();
  let merged = DetectionResults::merge(NUM_CLASSES, 10, partials).unwrap();
  assert_eq!(merged, full.results);
  let merged_reversed = DetectionResults::merge(NUM_CLASSES, 10, reversed).unwrap();
  assert_eq!(merged_reversed, full.results);

  for class in 1..NUM_CLASSES {
    for image in 0..10 {
      let boxes = merged.all_boxes.get(class, image).unwrap().len();
      let segms = merged.all_segms.get(class, image).unwrap().len();
      assert_eq!(boxes, segms);
    }
  }
  assert!(merged.all_boxes.get(0, 3).unwrap().is_empty());
}

#[test]
fn images_without_proposals_keep_empty_slots() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.test.precomputed_proposals = true;
  config.test.proposal_files = vec![PathBuf::from("toy_proposals.json")];

  let mut provider = MockProvider::new(4);
  for record in provider.records.iter_mut() {
    record.boxes = vec![[0.0, 0.0, 4.0, 4.0], [1.0, 1.0, 2.0, 2.0]];
    record.gt_classes = vec![2, NO_GROUND_TRUTH];
  }
  // 只有真值框
  provider.records[1].boxes.truncate(1);
  provider.records[1].gt_classes.truncate(1);

  let output = test_net(&config, &MockLoader::new(), &provider, &job(&config, None)).unwrap();
  let results = output.results;
  for class in 0..NUM_CLASSES {
    assert_eq!(results.all_boxes.get(class, 1), Some(&[][..]));
    assert_eq!(results.all_segms.get(class, 1), Some(&[][..]));
    assert_eq!(results.all_keyps.get(class, 1), Some(&[][..]));
  }
  // 序号 3 在类别 1、3 上有结果
  assert_eq!(results.all_boxes.get(1, 3).unwrap().len(), 1);
}

#[test]
fn precomputed_proposals_require_a_file() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  let job = job(&config, None);
  config.test.precomputed_proposals = true;
  assert!(job.proposal_file.is_none());

  let err = test_net(&config, &MockLoader::new(), &MockProvider::new(2), &job).unwrap_err();
  assert!(matches!(
    err,
    WorkerError::Dataset(DatasetError::MissingProposalFile)
  ));
}

#[test]
fn proposal_only_models_are_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.model.rpn_only = true;
  let err = test_net(&config, &MockLoader::new(), &MockProvider::new(2), &job(&config, None)).unwrap_err();
  assert!(matches!(err, WorkerError::Config(ConfigError::ProposalOnlyModel)));

  let loader = MockLoader {
    caps: Capabilities {
      proposals_only: true,
      ..Default::default()
    },
  };
  let config = self::config(dir.path());
  let err = test_net(&config, &loader, &MockProvider::new(2), &job(&config, None)).unwrap_err();
  assert!(matches!(err, WorkerError::Config(ConfigError::ProposalOnlyModel)));
}

fn calibrated_graphs(strategy: CalibrationStrategy, images: usize) -> (NetDef, Workspace) {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.quantization.calibrate = true;
  config.quantization.strategy = strategy;
  config.quantization.kl_calibration_images = 4;
  config.quantization.text_format = true;

  let output = test_net(&config, &MockLoader::new(), &MockProvider::new(images), &job(&config, None)).unwrap();
  // 校准用的重复记录不写入结果
  assert_eq!(output.results.num_images(), images);
  assert_eq!(output.int8_graphs.len(), 2);

  let (predict_path, init_path) = int8_graph_paths(&config.output_dir("toy"), NET, GraphFormat::Text);
  let predict = NetDef::load(&predict_path, GraphFormat::Text).unwrap();
  let init = NetDef::load(&init_path, GraphFormat::Text).unwrap();
  let mut ws = Workspace::new("check");
  ws.run_init(&init).unwrap();
  (predict, ws)
}

#[test]
fn every_strategy_produces_int8_graphs() {
  for strategy in [
    CalibrationStrategy::Absmax,
    CalibrationStrategy::MovingAverage,
    CalibrationStrategy::KlDivergence,
  ] {
    let (predict, ws) = calibrated_graphs(strategy, 3);
    let conv = predict
      .ops
      .iter()
      .find(|op| op.op_type.starts_with("Int8Conv"))
      .unwrap_or_else(|| panic!("{:?}: 没有 int8 卷积", strategy));
    let scale = conv.float_arg("Y_scale").unwrap();
    assert!(scale > 0.0 && scale.is_finite(), "{:?}: {}", strategy, scale);
    assert!(matches!(ws.blob("w_int8"), Some(Blob::Int8 { .. })));
    assert_eq!(predict.ops.last().unwrap().op_type, "Int8Dequantize");
  }
}

#[test]
fn int8_graphs_replace_float_graph_on_load() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.quantization.calibrate = true;
  test_net(&config, &MockLoader::new(), &MockProvider::new(3), &job(&config, None)).unwrap();

  let mut reload = self::config(dir.path());
  reload.quantization.int8_path = Some(config.output_dir("toy"));
  let loader = MockLoader::new();
  let primary = loader
    .load(Path::new("weights.json"), &LoadOptions::primary(0), &reload)
    .unwrap();
  assert!(primary.net.ops.iter().any(|op| op.op_type.starts_with("Int8")));
  assert!(primary.workspace.has_blob("w_int8"));

  let reference = loader
    .load(Path::new("weights.json"), &LoadOptions::reference(0), &reload)
    .unwrap();
  assert!(reference.net.ops.iter().all(|op| !op.op_type.starts_with("Int8")));
}

#[test]
fn cosim_and_profiling_do_not_change_results() {
  let dir = tempfile::tempdir().unwrap();
  let plain = config(dir.path());
  let expected = test_net(&plain, &MockLoader::new(), &MockProvider::new(5), &job(&plain, None)).unwrap();

  let mut config = config(dir.path());
  config.runtime.cosim = true;
  config.runtime.profile = true;
  config.runtime.warmup_pass = true;
  let output = test_net(&config, &MockLoader::new(), &MockProvider::new(5), &job(&config, None)).unwrap();
  assert_eq!(output.results, expected.results);
}

#[test]
fn single_device_run_saves_and_evaluates() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.expected_results.check = true;
  let options = RunOptions {
    weights: PathBuf::from("weights.json"),
    evaluate: true,
    ..Default::default()
  };

  let summary = run_inference(&config, &MockLoader::new(), &MockProvider::new(6), &DetectionSummary, &options).unwrap();
  assert_eq!(summary.runs.len(), 1);
  assert!(summary.runs[0].artifact.ends_with("test/toy/detections.pkl"));
  assert!(summary.expected_ok);

  let detections: usize = (1..NUM_CLASSES)
    .flat_map(|c| (0..6).map(move |i| (c, i)))
    .filter(|(c, i)| (c + i) % 2 == 0)
    .count();
  assert_eq!(
    summary.metrics.get("toy", TASK_BOX, "detections"),
    Some(detections as f64)
  );
}

#[test]
fn multi_device_run_requires_worker_binary() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.workers.binary = Some(dir.path().join("missing-test-net"));
  let options = RunOptions {
    weights: PathBuf::from("weights.json"),
    multi_device: true,
    device_count: 3,
    ..Default::default()
  };

  let err = run_inference(&config, &MockLoader::new(), &MockProvider::new(10), &DetectionSummary, &options).unwrap_err();
  assert!(matches!(
    err,
    OrchestratorError::Launch(LaunchError::BinaryNotFound(_))
  ));
  // 工作进程配置只包含一个数据集
  let worker = Config::load(&config.output_dir("toy").join(WORKER_CONFIG)).unwrap();
  assert_eq!(worker.test.datasets, vec!["toy".to_string()]);
}

#[test]
fn multi_device_rejects_more_devices_than_images() {
  let dir = tempfile::tempdir().unwrap();
  let config = config(dir.path());
  let options = RunOptions {
    weights: PathBuf::from("weights.json"),
    multi_device: true,
    device_count: 4,
    ..Default::default()
  };
  let err = run_inference(&config, &MockLoader::new(), &MockProvider::new(2), &DetectionSummary, &options).unwrap_err();
  assert!(matches!(err, OrchestratorError::Config(ConfigError::Partition(_))));
}

#[test]
fn calibration_requires_the_whole_dataset() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.quantization.calibrate = true;

  let err = test_net(
    &config,
    &MockLoader::new(),
    &MockProvider::new(4),
    &job(&config, Some(IndexRange::new(0, 2))),
  )
  .unwrap_err();
  assert!(matches!(
    err,
    WorkerError::Config(ConfigError::PartialCalibration(_))
  ));
  let (predict_path, _) = int8_graph_paths(&config.output_dir("toy"), NET, GraphFormat::Binary);
  assert!(!predict_path.exists());

  let options = RunOptions {
    weights: PathBuf::from("weights.json"),
    multi_device: true,
    device_count: 2,
    ..Default::default()
  };
  let err = run_inference(&config, &MockLoader::new(), &MockProvider::new(4), &DetectionSummary, &options).unwrap_err();
  assert!(matches!(
    err,
    OrchestratorError::Config(ConfigError::PartialCalibration(_))
  ));
  assert!(!config.output_dir("toy").join(WORKER_CONFIG).exists());
}

/// 写一个按 `--range` 拷贝预先生成结果的工作进程脚本
#[cfg(unix)]
fn worker_script(dir: &Path, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let path = dir.join("test-net.sh");
  let script = format!(
    r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --config) cfg="$2"; shift 2 ;;
    --range) range="$2"; shift 2 ;;
    *) shift ;;
  esac
done
s="${{range%,*}}"
e="${{range#*,}}"
out="$(dirname "$cfg")"
{}
"#,
    body
  );
  std::fs::write(&path, script).unwrap();
  std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
  path
}

#[cfg(unix)]
#[test]
fn multi_device_run_merges_worker_artifacts() {
  let dir = tempfile::tempdir().unwrap();
  let loader = MockLoader::new();
  let provider = MockProvider::new(10);

  // 预先生成各区间的结果，由脚本按区间拷贝
  let stage = config(&dir.path().join("stage"));
  let expected = test_net(&stage, &loader, &provider, &job(&stage, None)).unwrap();
  for range in partition(10, 3).unwrap() {
    test_net(&stage, &loader, &provider, &job(&stage, Some(range))).unwrap();
  }
  let staged = stage.output_dir("toy");
  let body = format!(
    r#"echo "range $s-$e"
cp "{}/detection_range_${{s}}_${{e}}.pkl" "$out/""#,
    staged.display()
  );

  let mut config = config(&dir.path().join("run"));
  config.workers.binary = Some(worker_script(dir.path(), &body));
  config.workers.poll_interval_ms = 10;
  let options = RunOptions {
    weights: PathBuf::from("weights.json"),
    multi_device: true,
    device_count: 3,
    ..Default::default()
  };

  let summary = run_inference(&config, &loader, &provider, &DetectionSummary, &options).unwrap();
  let output_dir = config.output_dir("toy");
  assert_eq!(summary.runs[0].artifact, output_dir.join("detections.pkl"));
  assert_eq!(summary.runs[0].results, expected.results);
  let saved = ResultArtifact::load_checked(&summary.runs[0].artifact, NUM_CLASSES).unwrap();
  assert_eq!(saved.into_results(), expected.results);

  let log = std::fs::read_to_string(output_dir.join("detection_range_4_7.log")).unwrap();
  assert_eq!(log.trim(), "range 4-7");
}

#[cfg(unix)]
#[test]
fn worker_without_artifact_fails_the_run() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = config(dir.path());
  config.workers.binary = Some(worker_script(dir.path(), "exit 0"));
  config.workers.poll_interval_ms = 10;
  let options = RunOptions {
    weights: PathBuf::from("weights.json"),
    multi_device: true,
    device_count: 2,
    ..Default::default()
  };

  let err = run_inference(&config, &MockLoader::new(), &MockProvider::new(4), &DetectionSummary, &options).unwrap_err();
  assert!(matches!(
    err,
    OrchestratorError::Artifact(ArtifactError::Missing { .. })
  ));
  assert!(!config.output_dir("toy").join("detections.pkl").exists());
}
