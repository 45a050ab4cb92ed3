// 该文件是 Shanan （山南西风） 项目的一部分。
// src/detection.rs - 检测结果的稀疏累积与合并
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::partition::IndexRange;

/// 背景类别的索引，任何产出方都不会写入该类别
pub const BACKGROUND_CLASS: usize = 0;

/// 单个检测框: [x1, y1, x2, y2] + 置信度
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxDetection {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
  pub score: f32,
}

impl BoxDetection {
  pub fn new(bbox: [f32; 4], score: f32) -> Self {
    Self {
      x1: bbox[0],
      y1: bbox[1],
      x2: bbox[2],
      y2: bbox[3],
      score,
    }
  }
}

/// 游程编码的实例掩码，只做拼接和序列化，不解析内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskRle {
  pub size: [u32; 2],
  pub counts: Vec<u8>,
}

/// 单个实例的关键点，按行存储 `[x, y, logit, prob]`，每行 `num_keypoints` 个值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointInstance {
  pub num_keypoints: usize,
  pub data: Vec<f32>,
}

impl KeypointInstance {
  pub const ROWS: usize = 4;

  pub fn is_well_formed(&self) -> bool {
    self.data.len() == Self::ROWS * self.num_keypoints
  }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DetectionSetError {
  #[error("类别数不匹配: 期望 {expected}, 实际 {actual}")]
  ClassCountMismatch { expected: usize, actual: usize },
  #[error("区间 {range} 的图像数不匹配: 期望 {expected}, 实际 {actual}")]
  ImageCountMismatch {
    range: IndexRange,
    expected: usize,
    actual: usize,
  },
  #[error("图像索引 {index} 越界 (共 {num_images} 张)")]
  ImageIndexOutOfRange { index: usize, num_images: usize },
  #[error("区间 {range} 超出数据集范围 (共 {num_images} 张)")]
  RangeOutOfBounds { range: IndexRange, num_images: usize },
  #[error("区间 {first} 与 {second} 重叠")]
  OverlappingRanges { first: IndexRange, second: IndexRange },
}

/// 稀疏的 `类别 -> 图像 -> 检测列表` 结构
///
/// 每个类别行在创建时就分配 `num_images` 个独立的空列表。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSet<T> {
  classes: Vec<Vec<Vec<T>>>,
}

impl<T> DetectionSet<T> {
  pub fn empty(num_classes: usize, num_images: usize) -> Self {
    let classes = (0..num_classes)
      .map(|_| (0..num_images).map(|_| Vec::new()).collect())
      .collect();
    Self { classes }
  }

  pub fn num_classes(&self) -> usize {
    self.classes.len()
  }

  pub fn num_images(&self) -> usize {
    self.classes.first().map(Vec::len).unwrap_or(0)
  }

  pub fn get(&self, class: usize, image: usize) -> Option<&[T]> {
    self
      .classes
      .get(class)
      .and_then(|row| row.get(image))
      .map(Vec::as_slice)
  }

  pub fn get_mut(&mut self, class: usize, image: usize) -> Option<&mut Vec<T>> {
    self.classes.get_mut(class).and_then(|row| row.get_mut(image))
  }

  pub fn class_row(&self, class: usize) -> Option<&[Vec<T>]> {
    self.classes.get(class).map(Vec::as_slice)
  }

  /// 所有槽位中的检测总数
  pub fn total(&self) -> usize {
    self.classes.iter().flatten().map(Vec::len).sum()
  }

  /// 把单张图像按类别索引的结果写入 `image_index` 槽位
  ///
  /// 这是覆盖写而不是追加；类别 0（背景）永远不会被写入。
  pub fn extend(&mut self, image_index: usize, per_image: Vec<Vec<T>>) -> Result<(), DetectionSetError> {
    let num_images = self.num_images();
    if image_index >= num_images {
      return Err(DetectionSetError::ImageIndexOutOfRange {
        index: image_index,
        num_images,
      });
    }
    if per_image.len() > self.num_classes() {
      return Err(DetectionSetError::ClassCountMismatch {
        expected: self.num_classes(),
        actual: per_image.len(),
      });
    }

    for (class, detections) in per_image.into_iter().enumerate().skip(BACKGROUND_CLASS + 1) {
      let slot = self.classes[class].get_mut(image_index).ok_or(
        DetectionSetError::ImageIndexOutOfRange {
          index: image_index,
          num_images,
        },
      )?;
      *slot = detections;
    }
    Ok(())
  }

  /// 按区间起点升序把各部分结果拷贝到全局偏移处
  ///
  /// 合并结果与 `partials` 的到达顺序无关。
  pub fn merge(
    num_classes: usize,
    num_images: usize,
    mut partials: Vec<(IndexRange, DetectionSet<T>)>,
  ) -> Result<Self, DetectionSetError> {
    partials.sort_by_key(|(range, _)| range.start);

    for pair in partials.windows(2) {
      let (first, second) = (pair[0].0, pair[1].0);
      if second.start < first.end {
        return Err(DetectionSetError::OverlappingRanges { first, second });
      }
    }

    let mut merged = Self::empty(num_classes, num_images);
    for (range, partial) in partials {
      if partial.num_classes() != num_classes {
        return Err(DetectionSetError::ClassCountMismatch {
          expected: num_classes,
          actual: partial.num_classes(),
        });
      }
      if range.end > num_images {
        return Err(DetectionSetError::RangeOutOfBounds { range, num_images });
      }
      // 反序列化得到的结果不保证每个类别行等长
      if let Some(actual) = partial
        .classes
        .iter()
        .map(Vec::len)
        .find(|&len| len != range.len())
      {
        return Err(DetectionSetError::ImageCountMismatch {
          range,
          expected: range.len(),
          actual,
        });
      }

      for (class, row) in partial.classes.into_iter().enumerate().skip(BACKGROUND_CLASS + 1) {
        for (local, detections) in row.into_iter().enumerate() {
          merged.classes[class][range.global_index(local)] = detections;
        }
      }
    }
    Ok(merged)
  }
}

/// 单张图像的推理输出，按类别索引
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ImageDetections {
  pub boxes: Vec<Vec<BoxDetection>>,
  pub segms: Option<Vec<Vec<MaskRle>>>,
  pub keyps: Option<Vec<Vec<KeypointInstance>>>,
}

impl ImageDetections {
  pub fn num_boxes(&self) -> usize {
    self.boxes.iter().skip(BACKGROUND_CLASS + 1).map(Vec::len).sum()
  }
}

/// 三个平行的检测结果集合：框、掩码、关键点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResults {
  pub all_boxes: DetectionSet<BoxDetection>,
  pub all_segms: DetectionSet<MaskRle>,
  pub all_keyps: DetectionSet<KeypointInstance>,
}

impl DetectionResults {
  pub fn empty(num_classes: usize, num_images: usize) -> Self {
    Self {
      all_boxes: DetectionSet::empty(num_classes, num_images),
      all_segms: DetectionSet::empty(num_classes, num_images),
      all_keyps: DetectionSet::empty(num_classes, num_images),
    }
  }

  pub fn num_classes(&self) -> usize {
    self.all_boxes.num_classes()
  }

  pub fn num_images(&self) -> usize {
    self.all_boxes.num_images()
  }

  pub fn extend(&mut self, image_index: usize, result: ImageDetections) -> Result<(), DetectionSetError> {
    self.all_boxes.extend(image_index, result.boxes)?;
    if let Some(segms) = result.segms {
      self.all_segms.extend(image_index, segms)?;
    }
    if let Some(keyps) = result.keyps {
      self.all_keyps.extend(image_index, keyps)?;
    }
    Ok(())
  }

  pub fn merge(
    num_classes: usize,
    num_images: usize,
    partials: Vec<(IndexRange, DetectionResults)>,
  ) -> Result<Self, DetectionSetError> {
    let mut boxes = Vec::with_capacity(partials.len());
    let mut segms = Vec::with_capacity(partials.len());
    let mut keyps = Vec::with_capacity(partials.len());
    for (range, partial) in partials {
      boxes.push((range, partial.all_boxes));
      segms.push((range, partial.all_segms));
      keyps.push((range, partial.all_keyps));
    }

    Ok(Self {
      all_boxes: DetectionSet::merge(num_classes, num_images, boxes)?,
      all_segms: DetectionSet::merge(num_classes, num_images, segms)?,
      all_keyps: DetectionSet::merge(num_classes, num_images, keyps)?,
    })
  }
}
