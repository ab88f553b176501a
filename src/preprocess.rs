// 该文件是 Yeshi （夜视） 项目的一部分。
// src/preprocess.rs - 低照度图像增强
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

//! 低照度预处理
//!
//! 顺序固定：
//! 1. 逐像素仿射变换 `clamp(alpha * v + beta, 0, 255)`；
//! 2. 可选地在 YUV 空间对亮度通道做全局直方图均衡或 CLAHE；
//! 3. 从增强后的彩色图（而不是原始帧）求灰度图。
//!
//! 灰度图只用于检测，彩色图用于标注与保存。

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::equalize_histogram;

mod clahe;
pub use self::clahe::clahe;

pub const DEFAULT_CLIP_LIMIT: f32 = 2.0;
pub const DEFAULT_TILE_GRID: u32 = 8;

// BT.601 亮度权重
const LUMA_R: f32 = 0.299;
const LUMA_G: f32 = 0.587;
const LUMA_B: f32 = 0.114;
const CHROMA_U: f32 = 0.492;
const CHROMA_V: f32 = 0.877;
const CHROMA_OFFSET: f32 = 128.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Equalization {
  /// 不做均衡
  None,
  /// 全局直方图均衡
  Global,
  /// 限制对比度的自适应直方图均衡
  Clahe { clip_limit: f32, tile_grid: u32 },
}

impl Equalization {
  pub fn clahe() -> Self {
    Equalization::Clahe {
      clip_limit: DEFAULT_CLIP_LIMIT,
      tile_grid: DEFAULT_TILE_GRID,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreprocessConfig {
  /// 对比度增益
  pub alpha: f32,
  /// 亮度偏移
  pub beta: i32,
  pub equalization: Equalization,
}

impl Default for PreprocessConfig {
  fn default() -> Self {
    Self {
      alpha: 1.6,
      beta: 35,
      equalization: Equalization::Global,
    }
  }
}

/// 预处理结果
#[derive(Debug, Clone)]
pub struct Enhanced {
  /// 检测用灰度图
  pub gray: GrayImage,
  /// 标注与保存用的增强彩色图
  pub color: RgbImage,
}

pub fn enhance(frame: &RgbImage, config: &PreprocessConfig) -> Enhanced {
  let brightened = brighten(frame, config.alpha, config.beta);

  let color = match config.equalization {
    Equalization::None => brightened,
    Equalization::Global => equalize_luma(&brightened, equalize_histogram),
    Equalization::Clahe {
      clip_limit,
      tile_grid,
    } => equalize_luma(&brightened, |y| clahe(y, clip_limit, tile_grid)),
  };

  let gray = luma(&color);
  Enhanced { gray, color }
}

/// 对比度 / 亮度调整，结果饱和到 [0, 255]
pub fn brighten(image: &RgbImage, alpha: f32, beta: i32) -> RgbImage {
  let mut lut = [0u8; 256];
  for (v, out) in lut.iter_mut().enumerate() {
    *out = (alpha * v as f32 + beta as f32).round().clamp(0.0, 255.0) as u8;
  }

  let mut output = image.clone();
  for sub in output.iter_mut() {
    *sub = lut[*sub as usize];
  }
  output
}

/// 标准亮度转换
pub fn luma(image: &RgbImage) -> GrayImage {
  let mut gray = GrayImage::new(image.width(), image.height());
  for (g, rgb) in gray.pixels_mut().zip(image.pixels()) {
    *g = Luma([luma_of(rgb)]);
  }
  gray
}

fn luma_of(Rgb([r, g, b]): &Rgb<u8>) -> u8 {
  (LUMA_R * *r as f32 + LUMA_G * *g as f32 + LUMA_B * *b as f32)
    .round()
    .min(255.0) as u8
}

/// 在 YUV 空间替换亮度通道后转换回 RGB
fn equalize_luma<F>(image: &RgbImage, equalize: F) -> RgbImage
where
  F: FnOnce(&GrayImage) -> GrayImage,
{
  let (width, height) = image.dimensions();
  let mut y_plane = GrayImage::new(width, height);
  let mut chroma = Vec::with_capacity((width * height) as usize);

  for (y, Rgb([r, g, b])) in y_plane.pixels_mut().zip(image.pixels()) {
    let (r, g, b) = (*r as f32, *g as f32, *b as f32);
    let luma = LUMA_R * r + LUMA_G * g + LUMA_B * b;
    *y = Luma([luma.round().clamp(0.0, 255.0) as u8]);
    chroma.push((
      CHROMA_U * (b - luma) + CHROMA_OFFSET,
      CHROMA_V * (r - luma) + CHROMA_OFFSET,
    ));
  }

  let y_plane = equalize(&y_plane);

  let mut output = RgbImage::new(width, height);
  for ((out, y), (u, v)) in output.pixels_mut().zip(y_plane.pixels()).zip(chroma) {
    let y = y.0[0] as f32;
    let (u, v) = (u - CHROMA_OFFSET, v - CHROMA_OFFSET);
    let r = y + v / CHROMA_V;
    let b = y + u / CHROMA_U;
    let g = (y - LUMA_R * r - LUMA_B * b) / LUMA_G;
    *out = Rgb([saturate(r), saturate(g), saturate(b)]);
  }
  output
}

fn saturate(v: f32) -> u8 {
  v.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  fn ramp(width: u32, height: u32, lo: u8, hi: u8) -> RgbImage {
    RgbImage::from_fn(width, height, |x, _| {
      let t = x as f32 / (width - 1).max(1) as f32;
      let v = (lo as f32 + t * (hi - lo) as f32).round() as u8;
      Rgb([v, v.saturating_add(10), v / 2])
    })
  }

  #[rstest]
  #[case(1.6, 35)]
  #[case(2.0, 0)]
  #[case(0.5, -40)]
  #[case(1.0, 300)]
  #[case(3.7, -500)]
  fn brighten_clamps_every_value(#[case] alpha: f32, #[case] beta: i32) {
    let all = RgbImage::from_fn(256, 1, |x, _| Rgb([x as u8, 255 - x as u8, x as u8]));
    let out = brighten(&all, alpha, beta);
    for (src, dst) in all.iter().zip(out.iter()) {
      let expected = (alpha * *src as f32 + beta as f32).round().clamp(0.0, 255.0);
      assert_eq!(*dst as f32, expected);
    }
  }

  #[test]
  fn identity_without_equalization() {
    let image = ramp(32, 4, 0, 200);
    let config = PreprocessConfig {
      alpha: 1.0,
      beta: 0,
      equalization: Equalization::None,
    };
    let enhanced = enhance(&image, &config);
    assert_eq!(enhanced.color, image);
  }

  #[rstest]
  #[case(Equalization::None)]
  #[case(Equalization::Global)]
  #[case(Equalization::clahe())]
  fn gray_comes_from_enhanced_color(#[case] equalization: Equalization) {
    let image = ramp(64, 16, 5, 60);
    let config = PreprocessConfig {
      equalization,
      ..PreprocessConfig::default()
    };
    let enhanced = enhance(&image, &config);
    assert_eq!(enhanced.gray, luma(&enhanced.color));
    assert_eq!(enhanced.gray.dimensions(), image.dimensions());
  }

  #[test]
  fn global_equalization_stretches_dark_frame() {
    let image = ramp(128, 8, 10, 40);
    let config = PreprocessConfig {
      alpha: 1.0,
      beta: 0,
      equalization: Equalization::Global,
    };
    let enhanced = enhance(&image, &config);
    let max = enhanced.gray.iter().copied().max().unwrap();
    let before = luma(&image).iter().copied().max().unwrap();
    assert!(max > before + 100, "max {} before {}", max, before);
  }

  #[test]
  fn luma_of_pure_colors() {
    let image = RgbImage::from_vec(3, 1, vec![255, 0, 0, 0, 255, 0, 0, 0, 255]).unwrap();
    let gray = luma(&image);
    assert_eq!(gray.as_raw(), &vec![76, 150, 29]);
  }

  #[test]
  fn yuv_round_trip_keeps_gray_pixels() {
    let image = RgbImage::from_pixel(4, 4, Rgb([90, 90, 90]));
    let out = equalize_luma(&image, |y| y.clone());
    assert_eq!(out, image);
  }
}
