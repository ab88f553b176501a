// 该文件是 Yeshi （夜视） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detector::{BoundingBox, DetectionResult};

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]); // 绿色
pub const BOX_THICKNESS: u32 = 2;

/// 绘制一个检测框，边框向内加粗，超出图像的部分被裁剪
fn draw_box(image: &mut RgbImage, bbox: &BoundingBox) {
  for t in 0..BOX_THICKNESS {
    let (w, h) = (bbox.width.saturating_sub(2 * t), bbox.height.saturating_sub(2 * t));
    if w == 0 || h == 0 {
      break;
    }
    let rect = Rect::at((bbox.x + t) as i32, (bbox.y + t) as i32).of_size(w, h);
    draw_hollow_rect_mut(image, rect, BOX_COLOR);
  }
}

/// 在增强后的彩色图像副本上绘制全部检测框，输入图像保持不变
pub fn annotate(image: &RgbImage, result: &DetectionResult) -> RgbImage {
  let mut annotated = image.clone();
  for bbox in result.iter() {
    draw_box(&mut annotated, bbox);
  }
  annotated
}

#[cfg(test)]
mod tests {
  use super::*;

  fn gray(w: u32, h: u32) -> RgbImage {
    RgbImage::from_pixel(w, h, Rgb([40, 40, 40]))
  }

  #[test]
  fn no_boxes_is_identity() {
    let image = RgbImage::from_fn(16, 9, |x, y| Rgb([x as u8, y as u8, (x * y) as u8]));
    let annotated = annotate(&image, &DetectionResult::default());
    assert_eq!(annotated, image);
  }

  #[test]
  fn draws_two_pixel_green_outline() {
    let image = gray(20, 20);
    let result = DetectionResult {
      items: vec![BoundingBox::new(4, 4, 10, 10)],
    };
    let annotated = annotate(&image, &result);

    assert_eq!(*annotated.get_pixel(4, 4), BOX_COLOR);
    assert_eq!(*annotated.get_pixel(5, 5), BOX_COLOR);
    assert_eq!(*annotated.get_pixel(13, 8), BOX_COLOR);
    assert_eq!(*annotated.get_pixel(12, 8), BOX_COLOR);
    // 内部与外部保持原样
    assert_eq!(*annotated.get_pixel(8, 8), Rgb([40, 40, 40]));
    assert_eq!(*annotated.get_pixel(3, 3), Rgb([40, 40, 40]));
    assert_eq!(*annotated.get_pixel(14, 14), Rgb([40, 40, 40]));
    // 输入未被修改
    assert_eq!(*image.get_pixel(4, 4), Rgb([40, 40, 40]));
  }

  #[test]
  fn box_past_the_edge_is_clipped() {
    let image = gray(10, 10);
    let result = DetectionResult {
      items: vec![BoundingBox::new(6, 6, 20, 20)],
    };
    let annotated = annotate(&image, &result);
    assert_eq!(annotated.dimensions(), (10, 10));
    assert_eq!(*annotated.get_pixel(6, 9), BOX_COLOR);
  }

  #[test]
  fn thin_box_is_drawn_once() {
    let image = gray(10, 10);
    let result = DetectionResult {
      items: vec![BoundingBox::new(2, 2, 1, 5)],
    };
    let annotated = annotate(&image, &result);
    assert_eq!(*annotated.get_pixel(2, 4), BOX_COLOR);
  }
}
