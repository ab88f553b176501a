// 该文件是 Yeshi （夜视） 项目的一部分。
// src/preprocess/clahe.rs - 限制对比度的自适应直方图均衡
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

use image::{GrayImage, Luma};

const BINS: usize = 256;

/// CLAHE
///
/// 图像划分为 `tile_grid × tile_grid` 个等大的块，尺寸不能整除时在右侧与下方按
/// reflect-101 方式补齐。每块独立计算裁剪后的直方图映射表，像素值由相邻四块
/// 映射表双线性插值得到。`clip_limit` 与 OpenCV 含义相同，以块内平均每个灰度级
/// 的像素数为单位。
pub fn clahe(image: &GrayImage, clip_limit: f32, tile_grid: u32) -> GrayImage {
  let (width, height) = image.dimensions();
  if width == 0 || height == 0 {
    return image.clone();
  }

  let tiles = tile_grid.max(1);
  let tile_w = width.div_ceil(tiles);
  let tile_h = height.div_ceil(tiles);

  let mut luts = Vec::with_capacity((tiles * tiles) as usize);
  for ty in 0..tiles {
    for tx in 0..tiles {
      luts.push(tile_lut(image, (tx * tile_w, ty * tile_h), (tile_w, tile_h), clip_limit));
    }
  }

  let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles + tx) as usize];

  let mut output = GrayImage::new(width, height);
  for (x, y, out) in output.enumerate_pixels_mut() {
    let v = image.get_pixel(x, y).0[0] as usize;

    let (tx1, tx2, xa) = neighbours(x, tile_w, tiles);
    let (ty1, ty2, ya) = neighbours(y, tile_h, tiles);

    let top = lut_at(tx1, ty1)[v] as f32 * (1.0 - xa) + lut_at(tx2, ty1)[v] as f32 * xa;
    let bottom = lut_at(tx1, ty2)[v] as f32 * (1.0 - xa) + lut_at(tx2, ty2)[v] as f32 * xa;
    let value = top * (1.0 - ya) + bottom * ya;

    *out = Luma([value.round().clamp(0.0, 255.0) as u8]);
  }
  output
}

/// 补齐区域的坐标映射，边界像素不重复（`dcb|abcd|cba`）
fn reflect101(pos: u32, len: u32) -> u32 {
  if pos < len {
    return pos;
  }
  if len == 1 {
    return 0;
  }
  let period = 2 * (len - 1);
  let m = pos % period;
  if m < len { m } else { period - m }
}

/// 返回相邻两块的序号以及到第一块中心的插值权重
fn neighbours(pos: u32, tile: u32, tiles: u32) -> (u32, u32, f32) {
  let f = pos as f32 / tile as f32 - 0.5;
  let first = f.floor();
  let weight = f - first;
  let last = (tiles - 1) as i64;
  let t1 = (first as i64).clamp(0, last) as u32;
  let t2 = (first as i64 + 1).clamp(0, last) as u32;
  (t1, t2, weight)
}

fn tile_lut(image: &GrayImage, (x0, y0): (u32, u32), (tile_w, tile_h): (u32, u32), clip_limit: f32) -> [u8; BINS] {
  let (width, height) = image.dimensions();
  let mut hist = [0u32; BINS];
  for y in y0..y0 + tile_h {
    for x in x0..x0 + tile_w {
      hist[image.get_pixel(reflect101(x, width), reflect101(y, height)).0[0] as usize] += 1;
    }
  }

  let area = tile_w * tile_h;

  if clip_limit > 0.0 {
    let clip = ((clip_limit * area as f32 / BINS as f32) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
      if *bin > clip {
        excess += *bin - clip;
        *bin = clip;
      }
    }

    let batch = excess / BINS as u32;
    let mut residual = excess % BINS as u32;
    for bin in hist.iter_mut() {
      *bin += batch;
    }
    if residual > 0 {
      let step = (BINS as u32 / residual).max(1) as usize;
      for bin in hist.iter_mut().step_by(step) {
        if residual == 0 {
          break;
        }
        *bin += 1;
        residual -= 1;
      }
    }
  }

  let scale = 255.0 / area as f32;
  let mut lut = [0u8; BINS];
  let mut sum = 0u32;
  for (bin, out) in hist.iter().zip(lut.iter_mut()) {
    sum += bin;
    *out = (sum as f32 * scale).round().min(255.0) as u8;
  }
  lut
}
