// 该文件是 Shanan （山南西风） 项目的一部分。
// src/calibrate/quantize.rs - 浮点子图改写为 int8 子图
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

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use super::QuantParams;
use crate::graph::{
  ArgValue, GIVEN_TENSOR_FILL, INT8_GIVEN_INT_TENSOR_FILL, INT8_GIVEN_TENSOR_FILL, NetDef,
  OperatorDef, Tensor, Workspace,
};

/// 有 int8 实现的算子
const QUANTIZABLE_OPS: &[&str] = &[
  "Conv",
  "ConvRelu",
  "FC",
  "Relu",
  "MaxPool",
  "AveragePool",
  "Add",
  "Sum",
  "Concat",
];

/// 第 1、2 个输入为权重与偏置的算子
const WEIGHTED_OPS: &[&str] = &["Conv", "ConvRelu", "FC"];

const INT8_QUANTIZE: &str = "Int8Quantize";
const INT8_DEQUANTIZE: &str = "Int8Dequantize";

/// 一对 int8 子图：推理子图与配套的初始化子图
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedNet {
  pub predict: NetDef,
  pub init: NetDef,
}

fn int8_name(blob: &str) -> String {
  format!("{}_int8", blob)
}

fn with_quant_args(op: OperatorDef, params: QuantParams) -> OperatorDef {
  op.with_arg("Y_scale", ArgValue::Float(params.scale))
    .with_arg("Y_zero_point", ArgValue::Int(params.zero_point as i64))
}

fn dims_arg(tensor: &Tensor) -> ArgValue {
  ArgValue::Ints(tensor.dims.iter().map(|&d| d as i64).collect())
}

struct Rewriter<'a> {
  workspace: &'a Workspace,
  params: &'a BTreeMap<String, QuantParams>,
  ops: Vec<OperatorDef>,
  init: Vec<OperatorDef>,
  initialized: HashSet<String>,
  /// 浮点张量名 -> 当前有效的 int8 张量名
  int8: HashMap<String, String>,
  /// 当前持有有效浮点值的张量
  fp32: HashSet<String>,
}

impl Rewriter<'_> {
  fn is_weighted(op: &OperatorDef) -> bool {
    WEIGHTED_OPS.contains(&op.op_type.as_str())
  }

  fn activation_inputs(op: &OperatorDef) -> &[String] {
    if Self::is_weighted(op) {
      &op.inputs[..op.inputs.len().min(1)]
    } else {
      &op.inputs
    }
  }

  fn can_quantize(&self, op: &OperatorDef) -> bool {
    if !QUANTIZABLE_OPS.contains(&op.op_type.as_str()) || op.outputs.is_empty() {
      return false;
    }
    if !op.outputs.iter().all(|o| self.params.contains_key(o)) {
      return false;
    }
    if !Self::activation_inputs(op)
      .iter()
      .all(|i| self.params.contains_key(i) || self.int8.contains_key(i))
    {
      return false;
    }
    if Self::is_weighted(op) {
      if op.inputs.len() < 2 {
        return false;
      }
      return op.inputs[1..].iter().all(|w| self.workspace.float(w).is_some());
    }
    true
  }

  fn input_params(&self, blob: &str) -> QuantParams {
    self
      .params
      .get(blob)
      .copied()
      .unwrap_or_else(|| QuantParams::from_threshold(0.0))
  }

  fn emit_weight(&mut self, blob: &str) -> Option<(String, QuantParams)> {
    let workspace = self.workspace;
    let tensor = workspace.float(blob)?;
    let name = int8_name(blob);
    let params = QuantParams::from_threshold(tensor.abs_max());
    if self.initialized.insert(name.clone()) {
      let values: Vec<u8> = tensor.data.iter().map(|&v| params.quantize(v) as u8).collect();
      let fill = OperatorDef::new(INT8_GIVEN_TENSOR_FILL, &[], &[&name])
        .with_arg("shape", dims_arg(tensor))
        .with_arg("values", ArgValue::Bytes(values));
      self.init.push(with_quant_args(fill, params));
    }
    Some((name, params))
  }

  fn emit_bias(&mut self, blob: &str, scale: f32) -> Option<String> {
    let workspace = self.workspace;
    let tensor = workspace.float(blob)?;
    let name = int8_name(blob);
    if self.initialized.insert(name.clone()) {
      let values: Vec<i64> = tensor
        .data
        .iter()
        .map(|&v| (v / scale).round() as i64)
        .collect();
      let params = QuantParams {
        scale,
        zero_point: 0,
      };
      let fill = OperatorDef::new(INT8_GIVEN_INT_TENSOR_FILL, &[], &[&name])
        .with_arg("shape", dims_arg(tensor))
        .with_arg("values", ArgValue::Ints(values));
      self.init.push(with_quant_args(fill, params));
    }
    Some(name)
  }

  fn emit_float(&mut self, blob: &str) {
    let workspace = self.workspace;
    let Some(tensor) = workspace.float(blob) else {
      return;
    };
    if self.initialized.insert(blob.to_string()) {
      self.init.push(
        OperatorDef::new(GIVEN_TENSOR_FILL, &[], &[blob])
          .with_arg("shape", dims_arg(tensor))
          .with_arg("values", ArgValue::Floats(tensor.data.clone())),
      );
    }
  }

  /// 让一个浮点张量可以被 int8 算子读取
  fn int8_input(&mut self, blob: &str) -> String {
    if let Some(alias) = self.int8.get(blob) {
      return alias.clone();
    }
    let alias = int8_name(blob);
    let params = self.input_params(blob);
    let quantize = OperatorDef::new(INT8_QUANTIZE, &[blob], &[&alias]);
    self.ops.push(with_quant_args(quantize, params));
    self.int8.insert(blob.to_string(), alias.clone());
    alias
  }

  /// 让一个只有 int8 版本的张量可以被浮点算子读取
  fn fp32_input(&mut self, blob: &str) {
    if self.fp32.contains(blob) {
      return;
    }
    if let Some(alias) = self.int8.get(blob).cloned() {
      self
        .ops
        .push(OperatorDef::new(INT8_DEQUANTIZE, &[&alias], &[blob]));
      self.fp32.insert(blob.to_string());
    } else {
      self.emit_float(blob);
      self.fp32.insert(blob.to_string());
    }
  }

  fn rewrite_int8(&mut self, op: &OperatorDef) {
    let mut new = op.clone();
    new.op_type = format!("Int8{}", op.op_type);

    let weighted = Self::is_weighted(op);
    let input_scale = self.input_params(&op.inputs[0]).scale;
    let mut weight_scale = 1.0;
    for (k, input) in op.inputs.iter().enumerate() {
      new.inputs[k] = match (weighted, k) {
        (true, 1) => match self.emit_weight(input) {
          Some((name, params)) => {
            weight_scale = params.scale;
            name
          }
          None => input.clone(),
        },
        (true, 2) => self
          .emit_bias(input, input_scale * weight_scale)
          .unwrap_or_else(|| input.clone()),
        _ => self.int8_input(input),
      };
    }

    for (k, output) in op.outputs.iter().enumerate() {
      let alias = int8_name(output);
      self.int8.insert(output.clone(), alias.clone());
      self.fp32.remove(output);
      new.outputs[k] = alias;
    }

    let params = self.input_params(&op.outputs[0]);
    self.ops.push(with_quant_args(new, params));
  }

  fn keep_fp32(&mut self, op: &OperatorDef) {
    for input in &op.inputs {
      self.fp32_input(input);
    }
    for output in &op.outputs {
      self.int8.remove(output);
      self.fp32.insert(output.clone());
    }
    self.ops.push(op.clone());
  }
}

/// 按激活张量的量化参数改写子图
///
/// 能量化的算子替换为 `Int8<类型>`，输出张量改名为 `<名称>_int8` 并带上
/// `Y_scale`/`Y_zero_point`；浮点与 int8 区域之间插入量化和反量化算子。
/// 权重、偏置与其余常量写入初始化子图。
pub fn quantize_net(
  net: &NetDef,
  workspace: &Workspace,
  params: &BTreeMap<String, QuantParams>,
) -> QuantizedNet {
  let mut rewriter = Rewriter {
    workspace,
    params,
    ops: Vec::new(),
    init: Vec::new(),
    initialized: HashSet::new(),
    int8: HashMap::new(),
    fp32: net.external_inputs.iter().cloned().collect(),
  };

  let mut converted = 0;
  for op in &net.ops {
    if rewriter.can_quantize(op) {
      rewriter.rewrite_int8(op);
      converted += 1;
    } else {
      debug!("算子 {} 保持浮点", op.label());
      rewriter.keep_fp32(op);
    }
  }

  let outputs: BTreeSet<&String> = net.external_outputs.iter().collect();
  for output in outputs {
    rewriter.fp32_input(output);
  }

  info!(
    "子图 {} 量化完成: {}/{} 个算子转换为 int8",
    net.name,
    converted,
    net.ops.len()
  );

  QuantizedNet {
    predict: NetDef {
      name: net.name.clone(),
      ops: rewriter.ops,
      external_inputs: net.external_inputs.clone(),
      external_outputs: net.external_outputs.clone(),
    },
    init: NetDef {
      name: format!("{}_init", net.name),
      ops: rewriter.init,
      external_inputs: Vec::new(),
      external_outputs: Vec::new(),
    },
  }
}
