// 该文件是 Yeshi （夜视） 项目的一部分。
// src/frame.rs - 视频帧定义
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

use std::time::Instant;

use image::RgbImage;

/// 采集到的一帧 RGB 图像
///
/// 各处理阶段只读取 `image`，并产出新的图像，不在原地修改。
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 采集序号（由采集源递增）
  pub index: u64,
  /// 采集时刻
  pub captured_at: Instant,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64) -> Self {
    Self {
      image,
      index,
      captured_at: Instant::now(),
    }
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }
}
