// 该文件是 Shanan （山南西风） 项目的一部分。
// src/graph/prepare.rs - 子图加载前的准备：int8 替换、算子命名与融合
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

use tracing::{info, warn};

use super::{GraphError, GraphFormat, NetDef, Workspace, int8_graph_paths};
use crate::config::Config;

pub struct GraphPreparation {
  /// 存放 int8 子图的目录；为 `None` 时保持浮点子图
  pub int8_dir: Option<PathBuf>,
  pub format: GraphFormat,
  pub name_ops: bool,
  pub optimize: bool,
  /// 调试模式下导出优化后子图的目录
  pub dump_dir: Option<PathBuf>,
}

impl GraphPreparation {
  /// `int8 == false` 时忽略 int8 子图，用于协同仿真中的浮点参考模型
  pub fn from_config(config: &Config, int8: bool, dump_dir: Option<PathBuf>) -> Self {
    Self {
      int8_dir: if int8 {
        config.quantization.int8_path.clone()
      } else {
        None
      },
      format: config.quantization.graph_format(),
      name_ops: config.runtime.debug_name_ops,
      optimize: !config.runtime.disable_optimization,
      dump_dir: if config.runtime.debug_name_ops {
        dump_dir
      } else {
        None
      },
    }
  }

  pub fn prepare(&self, net: &mut NetDef, workspace: &mut Workspace) -> Result<(), GraphError> {
    if let Some(dir) = &self.int8_dir {
      let (predict_path, init_path) = int8_graph_paths(dir, &net.name, self.format);
      if init_path.is_file() {
        warn!("加载子图 {} 的 int8 初始化文件", net.name);
        let init = NetDef::load(&init_path, self.format)?;
        workspace.run_init(&init)?;
      }
      if predict_path.is_file() {
        warn!("加载子图 {} 的 int8 推理文件", net.name);
        let predict = NetDef::load(&predict_path, self.format)?;
        *net = predict;
      }
    }

    if self.name_ops {
      name_unnamed_ops(net);
    }

    if self.optimize {
      let fused = optimize(net);
      info!("优化子图 {}: 融合 {} 对算子", net.name, fused);
    }

    if let Some(dir) = &self.dump_dir {
      for format in [GraphFormat::Binary, GraphFormat::Text] {
        let path = dir.join(format!("{}_opt_predict_net.{}", net.name, format.extension()));
        net.save(&path, format)?;
      }
    }
    Ok(())
  }
}

/// 给未命名算子命名为 `<小写类型><序号>`
pub fn name_unnamed_ops(net: &mut NetDef) {
  for (i, op) in net.ops.iter_mut().enumerate() {
    if op.name.is_empty() {
      op.name = format!("{}{}", op.op_type.to_lowercase(), i);
    }
  }
}

/// 把 `Conv` 与其唯一的后继 `Relu` 融合为 `ConvRelu`，返回融合次数
pub fn optimize(net: &mut NetDef) -> usize {
  let mut fused = 0;
  let mut i = 0;
  while i < net.ops.len() {
    if net.ops[i].op_type != "Conv" || net.ops[i].outputs.len() != 1 {
      i += 1;
      continue;
    }
    let output = net.ops[i].outputs[0].clone();
    if net.external_outputs.contains(&output) {
      i += 1;
      continue;
    }

    let consumers: Vec<usize> = net
      .ops
      .iter()
      .enumerate()
      .skip(i + 1)
      .filter(|(_, op)| op.inputs.contains(&output))
      .map(|(j, _)| j)
      .collect();
    let relu = match consumers.as_slice() {
      [j] if net.ops[*j].op_type == "Relu" && net.ops[*j].inputs.len() == 1 => *j,
      _ => {
        i += 1;
        continue;
      }
    };

    let relu_op = net.ops.remove(relu);
    let conv = &mut net.ops[i];
    conv.op_type = "ConvRelu".to_string();
    conv.outputs = relu_op.outputs;
    fused += 1;
    i += 1;
  }
  fused
}
