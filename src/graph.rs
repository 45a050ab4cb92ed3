// 该文件是 Shanan （山南西风） 项目的一部分。
// src/graph.rs - 网络子图与工作空间
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod prepare;
pub use self::prepare::{GraphPreparation, name_unnamed_ops, optimize};

pub const GIVEN_TENSOR_FILL: &str = "GivenTensorFill";
pub const INT8_GIVEN_TENSOR_FILL: &str = "Int8GivenTensorFill";
pub const INT8_GIVEN_INT_TENSOR_FILL: &str = "Int8GivenIntTensorFill";

#[derive(Error, Debug)]
pub enum GraphError {
  #[error("I/O 错误 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("二进制子图编解码错误 {path}: {source}")]
  Binary {
    path: PathBuf,
    source: bincode::Error,
  },
  #[error("文本子图编解码错误 {path}: {source}")]
  Text {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("初始化子图中不支持的算子 {op_type} ({name})")]
  UnsupportedInitOp { name: String, op_type: String },
  #[error("算子 {op} 缺少参数 {arg}")]
  MissingArgument { op: String, arg: String },
  #[error("算子 {op} 的数据长度 {actual} 与形状 {shape:?} 不符")]
  ShapeMismatch {
    op: String,
    shape: Vec<usize>,
    actual: usize,
  },
}

/// 算子参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
  Float(f32),
  Int(i64),
  Str(String),
  Floats(Vec<f32>),
  Ints(Vec<i64>),
  Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperatorDef {
  #[serde(default)]
  pub name: String,
  pub op_type: String,
  #[serde(default)]
  pub inputs: Vec<String>,
  #[serde(default)]
  pub outputs: Vec<String>,
  #[serde(default)]
  pub args: BTreeMap<String, ArgValue>,
}

impl OperatorDef {
  pub fn new(op_type: &str, inputs: &[&str], outputs: &[&str]) -> Self {
    Self {
      name: String::new(),
      op_type: op_type.to_string(),
      inputs: inputs.iter().map(|s| s.to_string()).collect(),
      outputs: outputs.iter().map(|s| s.to_string()).collect(),
      args: BTreeMap::new(),
    }
  }

  pub fn with_arg(mut self, name: &str, value: ArgValue) -> Self {
    self.args.insert(name.to_string(), value);
    self
  }

  /// 用于日志和错误信息的标识，未命名时退化为算子类型
  pub fn label(&self) -> &str {
    if self.name.is_empty() {
      &self.op_type
    } else {
      &self.name
    }
  }

  pub fn float_arg(&self, name: &str) -> Option<f32> {
    match self.args.get(name) {
      Some(ArgValue::Float(v)) => Some(*v),
      Some(ArgValue::Int(v)) => Some(*v as f32),
      _ => None,
    }
  }

  pub fn int_arg(&self, name: &str) -> Option<i64> {
    match self.args.get(name) {
      Some(ArgValue::Int(v)) => Some(*v),
      _ => None,
    }
  }

  fn shape_arg(&self) -> Result<Vec<usize>, GraphError> {
    match self.args.get("shape") {
      Some(ArgValue::Ints(dims)) => Ok(dims.iter().map(|&d| d.max(0) as usize).collect()),
      _ => Err(self.missing("shape")),
    }
  }

  fn missing(&self, arg: &str) -> GraphError {
    GraphError::MissingArgument {
      op: self.label().to_string(),
      arg: arg.to_string(),
    }
  }
}

/// 网络子图定义；`name` 为空表示匿名子图
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetDef {
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub ops: Vec<OperatorDef>,
  #[serde(default)]
  pub external_inputs: Vec<String>,
  #[serde(default)]
  pub external_outputs: Vec<String>,
}

impl NetDef {
  pub fn named(name: &str) -> Self {
    Self {
      name: name.to_string(),
      ..Default::default()
    }
  }

  pub fn is_named(&self) -> bool {
    !self.name.trim().is_empty()
  }

  pub fn load(path: &Path, format: GraphFormat) -> Result<Self, GraphError> {
    let bytes = std::fs::read(path).map_err(|source| GraphError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    match format {
      GraphFormat::Binary => bincode::deserialize(&bytes).map_err(|source| GraphError::Binary {
        path: path.to_path_buf(),
        source,
      }),
      GraphFormat::Text => serde_json::from_slice(&bytes).map_err(|source| GraphError::Text {
        path: path.to_path_buf(),
        source,
      }),
    }
  }

  pub fn save(&self, path: &Path, format: GraphFormat) -> Result<(), GraphError> {
    let bytes = match format {
      GraphFormat::Binary => bincode::serialize(self).map_err(|source| GraphError::Binary {
        path: path.to_path_buf(),
        source,
      })?,
      GraphFormat::Text => serde_json::to_vec_pretty(self).map_err(|source| GraphError::Text {
        path: path.to_path_buf(),
        source,
      })?,
    };
    std::fs::write(path, bytes).map_err(|source| GraphError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    debug!("子图 {} 已写入 {}", self.name, path.display());
    Ok(())
  }
}

/// 子图的持久化编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
  Binary,
  Text,
}

impl GraphFormat {
  pub fn extension(&self) -> &'static str {
    match self {
      GraphFormat::Binary => "pb",
      GraphFormat::Text => "pbtxt",
    }
  }
}

/// int8 子图文件路径: `(<name>_predict_int8.<ext>, <name>_init_int8.<ext>)`
pub fn int8_graph_paths(dir: &Path, name: &str, format: GraphFormat) -> (PathBuf, PathBuf) {
  let ext = format.extension();
  (
    dir.join(format!("{}_predict_int8.{}", name, ext)),
    dir.join(format!("{}_init_int8.{}", name, ext)),
  )
}

/// 浮点张量
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tensor {
  pub dims: Vec<usize>,
  pub data: Vec<f32>,
}

impl Tensor {
  pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Self {
    Self { dims, data }
  }

  pub fn abs_max(&self) -> f32 {
    self.data.iter().fold(0.0f32, |acc, v| acc.max(v.abs()))
  }
}

/// 工作空间中的数据块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Blob {
  Float(Tensor),
  Int8 {
    dims: Vec<usize>,
    data: Vec<i8>,
    scale: f32,
    zero_point: i32,
  },
  Int32 {
    dims: Vec<usize>,
    data: Vec<i32>,
    scale: f32,
    zero_point: i32,
  },
}

/// 一个独立的执行上下文，持有模型权重等数据块
///
/// 协同仿真时浮点模型和量化模型各自持有一个工作空间，互不共享。
#[derive(Debug, Clone, Default)]
pub struct Workspace {
  name: String,
  blobs: BTreeMap<String, Blob>,
}

impl Workspace {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      blobs: BTreeMap::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn feed(&mut self, name: &str, blob: Blob) {
    self.blobs.insert(name.to_string(), blob);
  }

  pub fn blob(&self, name: &str) -> Option<&Blob> {
    self.blobs.get(name)
  }

  pub fn float(&self, name: &str) -> Option<&Tensor> {
    match self.blobs.get(name) {
      Some(Blob::Float(tensor)) => Some(tensor),
      _ => None,
    }
  }

  pub fn has_blob(&self, name: &str) -> bool {
    self.blobs.contains_key(name)
  }

  pub fn blob_names(&self) -> impl Iterator<Item = &str> {
    self.blobs.keys().map(String::as_str)
  }

  /// 执行一次初始化子图，只支持常量填充类算子
  pub fn run_init(&mut self, init: &NetDef) -> Result<(), GraphError> {
    for op in &init.ops {
      let blob = match op.op_type.as_str() {
        GIVEN_TENSOR_FILL => {
          let dims = op.shape_arg()?;
          let data = match op.args.get("values") {
            Some(ArgValue::Floats(values)) => values.clone(),
            _ => return Err(op.missing("values")),
          };
          check_len(op, &dims, data.len())?;
          Blob::Float(Tensor::new(dims, data))
        }
        INT8_GIVEN_TENSOR_FILL => {
          let dims = op.shape_arg()?;
          let data: Vec<i8> = match op.args.get("values") {
            Some(ArgValue::Bytes(values)) => values.iter().map(|&b| b as i8).collect(),
            _ => return Err(op.missing("values")),
          };
          check_len(op, &dims, data.len())?;
          Blob::Int8 {
            dims,
            data,
            scale: op.float_arg("Y_scale").ok_or_else(|| op.missing("Y_scale"))?,
            zero_point: op.int_arg("Y_zero_point").unwrap_or(0) as i32,
          }
        }
        INT8_GIVEN_INT_TENSOR_FILL => {
          let dims = op.shape_arg()?;
          let data: Vec<i32> = match op.args.get("values") {
            Some(ArgValue::Ints(values)) => values.iter().map(|&v| v as i32).collect(),
            _ => return Err(op.missing("values")),
          };
          check_len(op, &dims, data.len())?;
          Blob::Int32 {
            dims,
            data,
            scale: op.float_arg("Y_scale").ok_or_else(|| op.missing("Y_scale"))?,
            zero_point: op.int_arg("Y_zero_point").unwrap_or(0) as i32,
          }
        }
        other => {
          return Err(GraphError::UnsupportedInitOp {
            name: op.label().to_string(),
            op_type: other.to_string(),
          });
        }
      };
      for output in &op.outputs {
        self.blobs.insert(output.clone(), blob.clone());
      }
    }
    debug!(
      "工作空间 {} 执行初始化子图 {}，共 {} 个数据块",
      self.name,
      init.name,
      self.blobs.len()
    );
    Ok(())
  }
}

fn check_len(op: &OperatorDef, dims: &[usize], actual: usize) -> Result<(), GraphError> {
  let expected: usize = dims.iter().product();
  if expected != actual {
    return Err(GraphError::ShapeMismatch {
      op: op.label().to_string(),
      shape: dims.to_vec(),
      actual,
    });
  }
  Ok(())
}
