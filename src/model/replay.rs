// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/replay.rs - 回放录制结果的检测模型
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
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  config::Config,
  dataset::ImageRecord,
  detection::{BoxDetection, ImageDetections, KeypointInstance, MaskRle},
  graph::{Blob, GraphPreparation, NetDef, Tensor, Workspace},
  model::{Capabilities, InferenceObserver, LoadOptions, Model, ModelLoader, NetRole},
  timer::{IM_DETECT_BBOX, IM_DETECT_KEYPOINTS, IM_DETECT_MASK, MISC_BBOX, Timers},
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("读取录制文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("解析录制文件 {path} 失败: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("录制文件中没有图像 {0}")]
  UnknownImage(PathBuf),
  #[error("类别 {class} 超出范围 (共 {num_classes} 类)")]
  ClassOutOfRange { class: usize, num_classes: usize },
  #[error("录制的类别数 {recorded} 与配置的 {configured} 不一致")]
  ClassCountMismatch { recorded: usize, configured: usize },
  #[error("{image} 中类别 {class} 的实例缺少关键点或关键点形状不正确")]
  BadKeypoints { image: PathBuf, class: usize },
  #[error("子图准备失败: {0}")]
  Graph(#[from] crate::graph::GraphError),
}

/// 录制的单个检测实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayInstance {
  pub class: usize,
  pub bbox: [f32; 4],
  pub score: f32,
  #[serde(default)]
  pub mask: Option<MaskRle>,
  #[serde(default)]
  pub keypoints: Option<KeypointInstance>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplayImage {
  #[serde(default)]
  pub instances: Vec<ReplayInstance>,
  /// 子图名 -> 数据块名 -> 激活值
  #[serde(default)]
  pub activations: BTreeMap<String, BTreeMap<String, Vec<f32>>>,
  /// 子图名 -> 算子名 -> 耗时（微秒）
  #[serde(default)]
  pub op_timings_us: BTreeMap<String, BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayNet {
  pub role: NetRole,
  pub net: NetDef,
}

/// 录制文件的内容
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplayRecording {
  pub num_classes: usize,
  #[serde(default)]
  pub capabilities: Capabilities,
  #[serde(default)]
  pub nets: Vec<ReplayNet>,
  /// 权重等初始数据块
  #[serde(default)]
  pub blobs: BTreeMap<String, Tensor>,
  /// 以图像文件名为键
  #[serde(default)]
  pub images: BTreeMap<String, ReplayImage>,
}

impl ReplayRecording {
  pub fn open(path: &Path) -> Result<Self, ReplayError> {
    let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_str(&text).map_err(|source| ReplayError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// 按图像文件名回放录制的推理结果、激活值与算子耗时
pub struct ReplayModel {
  recording: ReplayRecording,
  nets: BTreeMap<NetRole, NetDef>,
  workspace: Workspace,
  device: usize,
}

impl ReplayModel {
  pub fn new(recording: ReplayRecording, workspace: &str, device: usize) -> Self {
    let mut ws = Workspace::new(workspace);
    for (name, tensor) in &recording.blobs {
      ws.feed(name, Blob::Float(tensor.clone()));
    }
    let nets = recording
      .nets
      .iter()
      .filter(|net| net.role.is_supported(&recording.capabilities))
      .map(|net| (net.role, net.net.clone()))
      .collect();
    Self {
      recording,
      nets,
      workspace: ws,
      device,
    }
  }

  pub fn device(&self) -> usize {
    self.device
  }

  fn lookup(&self, record: &ImageRecord) -> Result<&ReplayImage, ReplayError> {
    let key = record
      .image
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default();
    self
      .recording
      .images
      .get(&key)
      .ok_or_else(|| ReplayError::UnknownImage(record.image.clone()))
  }

  fn replay_observations(&self, image: &ReplayImage, observer: &mut dyn InferenceObserver) {
    for (net, blobs) in &image.activations {
      for (blob, values) in blobs {
        observer.on_activation(net, blob, values);
      }
    }
    for (net, ops) in &image.op_timings_us {
      for (op, micros) in ops {
        observer.on_op_timing(net, op, Duration::from_micros(*micros));
      }
    }
  }
}

impl Model for ReplayModel {
  type Error = ReplayError;

  fn capabilities(&self) -> Capabilities {
    self.recording.capabilities
  }

  fn infer(
    &self,
    record: &ImageRecord,
    proposals: Option<&[[f32; 4]]>,
    timers: &mut Timers,
    observer: &mut dyn InferenceObserver,
  ) -> Result<ImageDetections, Self::Error> {
    let num_classes = self.recording.num_classes;
    let caps = self.recording.capabilities;

    timers.tic(IM_DETECT_BBOX);
    let image = self.lookup(record)?;
    if let Some(proposals) = proposals {
      debug!("{} 使用 {} 个预计算候选框", record.image.display(), proposals.len());
    }
    self.replay_observations(image, observer);
    timers.toc(IM_DETECT_BBOX);

    timers.tic(MISC_BBOX);
    let mut boxes = vec![Vec::new(); num_classes];
    for instance in &image.instances {
      if instance.class >= num_classes {
        return Err(ReplayError::ClassOutOfRange {
          class: instance.class,
          num_classes,
        });
      }
      boxes[instance.class].push(BoxDetection::new(instance.bbox, instance.score));
    }
    timers.toc(MISC_BBOX);

    // 掩码与关键点与框保持一一对应
    let segms = caps.masks.then(|| {
      timers.tic(IM_DETECT_MASK);
      let mut segms = vec![Vec::new(); num_classes];
      for instance in &image.instances {
        segms[instance.class].push(instance.mask.clone().unwrap_or(MaskRle {
          size: [0, 0],
          counts: Vec::new(),
        }));
      }
      timers.toc(IM_DETECT_MASK);
      segms
    });

    let keyps = if caps.keypoints {
      timers.tic(IM_DETECT_KEYPOINTS);
      let mut keyps = vec![Vec::new(); num_classes];
      for instance in &image.instances {
        match &instance.keypoints {
          Some(keypoints) if keypoints.is_well_formed() => {
            keyps[instance.class].push(keypoints.clone());
          }
          _ => {
            return Err(ReplayError::BadKeypoints {
              image: record.image.clone(),
              class: instance.class,
            });
          }
        }
      }
      timers.toc(IM_DETECT_KEYPOINTS);
      Some(keyps)
    } else {
      None
    };

    Ok(ImageDetections {
      boxes,
      segms,
      keyps,
    })
  }

  fn net(&self, role: NetRole) -> Option<&NetDef> {
    self.nets.get(&role)
  }

  fn net_and_workspace_mut(&mut self, role: NetRole) -> Option<(&mut NetDef, &mut Workspace)> {
    let net = self.nets.get_mut(&role)?;
    Some((net, &mut self.workspace))
  }

  fn workspace(&self) -> &Workspace {
    &self.workspace
  }
}

/// 以 `replay:///path/to/recording.json` 或普通路径指定录制文件
#[derive(Debug, Clone, Default)]
pub struct ReplayLoader {
  pub dump_dir: Option<PathBuf>,
}

const REPLAY_SCHEME: &str = "replay";

impl FromUrlWithScheme for ReplayLoader {
  const SCHEME: &'static str = REPLAY_SCHEME;
}

impl FromUrl for ReplayLoader {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayError::SchemeMismatch);
    }
    let dump_dir = url
      .query_pairs()
      .find(|(k, _)| k == "dump")
      .map(|(_, v)| PathBuf::from(v.into_owned()));
    Ok(ReplayLoader { dump_dir })
  }
}

impl ReplayLoader {
  /// `weights` 为 `replay://` URL 时读取其中的参数，否则使用缺省导出目录
  pub fn from_weights(weights: &Path, dump_dir: Option<PathBuf>) -> Result<Self, ReplayError> {
    let loader = match Url::parse(&weights.to_string_lossy()) {
      Ok(url) if url.scheme() == Self::SCHEME => Self::from_url(&url)?,
      _ => Self::default(),
    };
    Ok(Self {
      dump_dir: loader.dump_dir.or(dump_dir),
    })
  }
}

fn recording_path(weights: &Path) -> PathBuf {
  let text = weights.to_string_lossy();
  match Url::parse(&text) {
    Ok(url) if url.scheme() == REPLAY_SCHEME => PathBuf::from(url.path()),
    _ => weights.to_path_buf(),
  }
}

impl ModelLoader for ReplayLoader {
  type Model = ReplayModel;
  type Error = ReplayError;

  fn load(
    &self,
    weights: &Path,
    options: &LoadOptions,
    config: &Config,
  ) -> Result<ReplayModel, ReplayError> {
    let path = recording_path(weights);
    info!(
      "加载录制文件: {} (设备 {}, 工作空间 {})",
      path.display(),
      options.device,
      options.workspace
    );
    let recording = ReplayRecording::open(&path)?;
    if recording.num_classes != config.model.num_classes {
      return Err(ReplayError::ClassCountMismatch {
        recorded: recording.num_classes,
        configured: config.model.num_classes,
      });
    }

    let mut model = ReplayModel::new(recording, &options.workspace, options.device);
    let preparation = GraphPreparation::from_config(config, options.int8, self.dump_dir.clone());
    for role in NetRole::ALL {
      if let Some((net, ws)) = model.net_and_workspace_mut(role) {
        preparation.prepare(net, ws)?;
      }
    }
    info!("模型加载完成");
    Ok(model)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::NoObserver;

  fn recording() -> ReplayRecording {
    let mut images = BTreeMap::new();
    images.insert(
      "a.jpg".to_string(),
      ReplayImage {
        instances: vec![
          ReplayInstance {
            class: 1,
            bbox: [0.0, 0.0, 4.0, 4.0],
            score: 0.9,
            mask: Some(MaskRle {
              size: [8, 8],
              counts: b"x1".to_vec(),
            }),
            keypoints: None,
          },
          ReplayInstance {
            class: 2,
            bbox: [1.0, 1.0, 2.0, 2.0],
            score: 0.4,
            mask: None,
            keypoints: None,
          },
        ],
        ..Default::default()
      },
    );
    ReplayRecording {
      num_classes: 3,
      capabilities: Capabilities {
        masks: true,
        ..Default::default()
      },
      images,
      ..Default::default()
    }
  }

  #[test]
  fn replays_by_file_name() {
    let model = ReplayModel::new(recording(), "ws", 0);
    let mut timers = Timers::new();
    let result = model
      .infer(
        &ImageRecord::new("/data/val/a.jpg"),
        None,
        &mut timers,
        &mut NoObserver,
      )
      .unwrap();

    assert!(result.boxes[0].is_empty());
    assert_eq!(result.boxes[1].len(), 1);
    assert_eq!(result.boxes[2][0].score, 0.4);
    let segms = result.segms.unwrap();
    assert_eq!(segms[1].len(), 1);
    assert_eq!(segms[2].len(), 1);
    assert!(result.keyps.is_none());
    assert_eq!(timers.timer(IM_DETECT_BBOX).calls(), 1);
  }

  #[test]
  fn keypoints_stay_parallel_to_boxes() {
    let keypoints = KeypointInstance {
      num_keypoints: 1,
      data: vec![1.0, 2.0, 0.5, 0.9],
    };
    let mut rec = recording();
    rec.capabilities.keypoints = true;
    for instance in rec.images.values_mut().flat_map(|i| i.instances.iter_mut()) {
      instance.keypoints = Some(keypoints.clone());
    }
    let model = ReplayModel::new(rec.clone(), "ws", 0);
    let result = model
      .infer(&ImageRecord::new("a.jpg"), None, &mut Timers::new(), &mut NoObserver)
      .unwrap();
    let keyps = result.keyps.unwrap();
    for class in 0..3 {
      assert_eq!(keyps[class].len(), result.boxes[class].len());
    }

    // 同一张图中部分实例没有关键点
    if let Some(image) = rec.images.get_mut("a.jpg") {
      image.instances[1].keypoints = None;
    }
    let model = ReplayModel::new(rec.clone(), "ws", 0);
    let err = model
      .infer(&ImageRecord::new("a.jpg"), None, &mut Timers::new(), &mut NoObserver)
      .unwrap_err();
    assert!(matches!(err, ReplayError::BadKeypoints { class: 2, .. }));

    if let Some(image) = rec.images.get_mut("a.jpg") {
      image.instances[1].keypoints = Some(KeypointInstance {
        num_keypoints: 2,
        data: vec![0.0; 3],
      });
    }
    let model = ReplayModel::new(rec, "ws", 0);
    let err = model
      .infer(&ImageRecord::new("a.jpg"), None, &mut Timers::new(), &mut NoObserver)
      .unwrap_err();
    assert!(matches!(err, ReplayError::BadKeypoints { class: 2, .. }));
  }

  #[test]
  fn unknown_image_is_an_error() {
    let model = ReplayModel::new(recording(), "ws", 0);
    let err = model
      .infer(&ImageRecord::new("b.jpg"), None, &mut Timers::new(), &mut NoObserver)
      .unwrap_err();
    assert!(matches!(err, ReplayError::UnknownImage(_)));
  }

  #[test]
  fn url_and_plain_paths() {
    assert_eq!(
      recording_path(Path::new("replay:///models/rec.json")),
      PathBuf::from("/models/rec.json")
    );
    assert_eq!(recording_path(Path::new("rec.json")), PathBuf::from("rec.json"));

    let url = Url::parse("replay:///x?dump=/tmp/dump").unwrap();
    let loader = ReplayLoader::from_url(&url).unwrap();
    assert_eq!(loader.dump_dir, Some(PathBuf::from("/tmp/dump")));
    assert!(ReplayLoader::from_url(&Url::parse("file:///x").unwrap()).is_err());
  }
}
