// 该文件是 Yeshi （夜视） 项目的一部分。
// src/detector/haar.rs - Haar 级联分类器
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

use std::path::Path;
use std::str::FromStr;

use image::GrayImage;
use image::imageops::{self, FilterType};
use roxmltree::{Document, Node};
use thiserror::Error;

use super::{BoundingBox, DetectionParameters, DetectorLoadError, FaceDetector, group_rectangles};

/// 合并窗口时的相对容差
pub const GROUP_EPS: f64 = 0.2;

/// 读取阶段阈值时减去的容差
const STAGE_THRESHOLD_EPS: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum CascadeError {
  #[error("XML 解析失败: {0}")]
  Xml(#[from] roxmltree::Error),
  #[error("级联结构错误: {0}")]
  Malformed(String),
  #[error("不支持的级联: {0}")]
  Unsupported(String),
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
  x: u32,
  y: u32,
  width: u32,
  height: u32,
  weight: f64,
}

#[derive(Debug, Clone)]
struct Feature {
  rects: Vec<WeightedRect>,
}

/// 决策树内部节点。`left`/`right` 为正数时指向同一棵树中的节点，
/// 否则其相反数是叶子下标。
#[derive(Debug, Clone, Copy)]
struct TreeNode {
  left: i32,
  right: i32,
  feature: usize,
  threshold: f64,
}

#[derive(Debug, Clone)]
struct WeakClassifier {
  nodes: Vec<TreeNode>,
  leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
  threshold: f64,
  classifiers: Vec<WeakClassifier>,
}

/// OpenCV 新格式（`opencv_storage/cascade`）的 BOOST + HAAR 级联
#[derive(Debug, Clone)]
pub struct HaarCascade {
  window_width: u32,
  window_height: u32,
  stages: Vec<Stage>,
  features: Vec<Feature>,
}

fn malformed(msg: impl Into<String>) -> CascadeError {
  CascadeError::Malformed(msg.into())
}

fn child<'a, 'i>(node: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, CascadeError> {
  node
    .children()
    .find(|n| n.has_tag_name(name))
    .ok_or_else(|| malformed(format!("<{}> 缺少 <{}>", node.tag_name().name(), name)))
}

fn items<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
  node.children().filter(|n| n.has_tag_name("_"))
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
  node.text().unwrap_or("").trim()
}

fn numbers<T: FromStr>(node: Node<'_, '_>) -> Result<Vec<T>, CascadeError> {
  text(node)
    .split_whitespace()
    .map(|s| {
      s.parse::<T>()
        .map_err(|_| malformed(format!("<{}> 中的数值无效: {}", node.tag_name().name(), s)))
    })
    .collect()
}

fn number<T: FromStr>(node: Node<'_, '_>, name: &str) -> Result<T, CascadeError> {
  let value = child(node, name)?;
  text(value)
    .parse::<T>()
    .map_err(|_| malformed(format!("<{}> 的值无效: {}", name, text(value))))
}

/// 决策树中的整数字段（子节点链接、特征下标）
fn node_index(value: f64) -> Result<i32, CascadeError> {
  if value.fract() != 0.0 || value.abs() > i32::MAX as f64 {
    return Err(malformed(format!("决策树字段不是有效整数: {}", value)));
  }
  Ok(value as i32)
}

impl HaarCascade {
  pub fn from_file(path: &Path) -> Result<Self, DetectorLoadError> {
    let xml = std::fs::read_to_string(path).map_err(|source| DetectorLoadError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_xml(&xml).map_err(|source| DetectorLoadError::Cascade {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if !root.has_tag_name("opencv_storage") {
      return Err(malformed(format!("根元素应为 <opencv_storage>，实际为 <{}>", root.tag_name().name())));
    }
    let cascade = root
      .children()
      .find(|n| n.has_tag_name("cascade"))
      .ok_or_else(|| CascadeError::Unsupported("仅支持新格式 <cascade> 级联".to_string()))?;

    let stage_type = text(child(cascade, "stageType")?);
    if stage_type != "BOOST" {
      return Err(CascadeError::Unsupported(format!("stageType {}", stage_type)));
    }
    let feature_type = text(child(cascade, "featureType")?);
    if feature_type != "HAAR" {
      return Err(CascadeError::Unsupported(format!("featureType {}", feature_type)));
    }

    let window_width: u32 = number(cascade, "width")?;
    let window_height: u32 = number(cascade, "height")?;
    if window_width < 3 || window_height < 3 {
      return Err(malformed(format!("窗口尺寸过小: {}x{}", window_width, window_height)));
    }

    let features = items(child(cascade, "features")?)
      .map(|node| Self::parse_feature(node, window_width, window_height))
      .collect::<Result<Vec<_>, _>>()?;

    let stages = items(child(cascade, "stages")?)
      .map(|node| Self::parse_stage(node, features.len()))
      .collect::<Result<Vec<_>, _>>()?;
    if stages.is_empty() {
      return Err(malformed("级联不含任何阶段"));
    }

    Ok(Self {
      window_width,
      window_height,
      stages,
      features,
    })
  }

  fn parse_feature(node: Node<'_, '_>, window_width: u32, window_height: u32) -> Result<Feature, CascadeError> {
    let tilted = node.children().find(|n| n.has_tag_name("tilted"));
    if tilted.is_some_and(|t| text(t) != "0") {
      return Err(CascadeError::Unsupported("倾斜 Haar 特征".to_string()));
    }

    let rects = items(child(node, "rects")?)
      .map(|rect| {
        let values: Vec<&str> = text(rect).split_whitespace().collect();
        if values.len() != 5 {
          return Err(malformed(format!("矩形应有 5 个值: {}", text(rect))));
        }
        let coord = |s: &str| s.parse::<u32>().map_err(|_| malformed(format!("矩形坐标无效: {}", s)));
        let r = WeightedRect {
          x: coord(values[0])?,
          y: coord(values[1])?,
          width: coord(values[2])?,
          height: coord(values[3])?,
          weight: values[4]
            .parse::<f64>()
            .map_err(|_| malformed(format!("矩形权重无效: {}", values[4])))?,
        };
        if r.x + r.width > window_width || r.y + r.height > window_height {
          return Err(malformed(format!("矩形超出检测窗口: {}", text(rect))));
        }
        Ok(r)
      })
      .collect::<Result<Vec<_>, _>>()?;

    if rects.is_empty() {
      return Err(malformed("特征不含矩形"));
    }
    Ok(Feature { rects })
  }

  fn parse_stage(node: Node<'_, '_>, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold = number::<f64>(node, "stageThreshold")? - STAGE_THRESHOLD_EPS;
    let classifiers = items(child(node, "weakClassifiers")?)
      .map(|weak| Self::parse_weak(weak, feature_count))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage { threshold, classifiers })
  }

  fn parse_weak(node: Node<'_, '_>, feature_count: usize) -> Result<WeakClassifier, CascadeError> {
    let raw: Vec<f64> = numbers(child(node, "internalNodes")?)?;
    let leaves: Vec<f64> = numbers(child(node, "leafValues")?)?;
    if raw.is_empty() || raw.len() % 4 != 0 {
      return Err(malformed(format!("internalNodes 无效（{} 个值）", raw.len())));
    }

    let nodes = raw
      .chunks_exact(4)
      .map(|c| {
        let feature = node_index(c[2])?;
        if feature < 0 {
          return Err(malformed(format!("特征下标无效: {}", c[2])));
        }
        Ok(TreeNode {
          left: node_index(c[0])?,
          right: node_index(c[1])?,
          feature: feature as usize,
          threshold: c[3],
        })
      })
      .collect::<Result<Vec<_>, CascadeError>>()?;

    for (i, n) in nodes.iter().enumerate() {
      if n.feature >= feature_count {
        return Err(malformed(format!("特征下标越界: {}", n.feature)));
      }
      for link in [n.left, n.right] {
        let target = link.unsigned_abs() as usize;
        let valid = if link > 0 { target > i && target < nodes.len() } else { target < leaves.len() };
        if !valid {
          return Err(malformed(format!("决策树链接无效: {}", link)));
        }
      }
    }

    Ok(WeakClassifier { nodes, leaves })
  }

  pub fn window_size(&self) -> (u32, u32) {
    (self.window_width, self.window_height)
  }

  fn feature_value(&self, feature: usize, ii: &IntegralImage, x: u32, y: u32) -> f64 {
    self.features[feature]
      .rects
      .iter()
      .map(|r| r.weight * ii.sum(x + r.x, y + r.y, r.width, r.height) as f64)
      .sum()
  }

  fn evaluate_window(&self, ii: &IntegralImage, x: u32, y: u32) -> bool {
    let (nx, ny) = (x + 1, y + 1);
    let (nw, nh) = (self.window_width - 2, self.window_height - 2);
    let area = (nw * nh) as f64;
    let sum = ii.sum(nx, ny, nw, nh) as f64;
    let sqsum = ii.sq_sum(nx, ny, nw, nh) as f64;
    let var = area * sqsum - sum * sum;
    let norm = if var > 0.0 { var.sqrt() } else { 1.0 };

    self.stages.iter().all(|stage| {
      let score: f64 = stage
        .classifiers
        .iter()
        .map(|weak| {
          let mut idx = 0i32;
          loop {
            let node = &weak.nodes[idx as usize];
            let value = self.feature_value(node.feature, ii, x, y) / norm;
            idx = if value < node.threshold { node.left } else { node.right };
            if idx <= 0 {
              break weak.leaves[idx.unsigned_abs() as usize];
            }
          }
        })
        .sum();
      score >= stage.threshold
    })
  }

  /// 多尺度滑窗，返回未合并的候选窗口（原图坐标）
  pub fn detect_raw(&self, gray: &GrayImage, params: &DetectionParameters) -> Vec<BoundingBox> {
    let mut found = Vec::new();
    if !(params.scale_factor.is_finite() && params.scale_factor > 1.0) {
      return found;
    }
    let (img_w, img_h) = gray.dimensions();

    let mut factor = 1.0f64;
    loop {
      let win_w = (self.window_width as f64 * factor).round() as u32;
      let win_h = (self.window_height as f64 * factor).round() as u32;
      let scaled_w = (img_w as f64 / factor).round() as u32;
      let scaled_h = (img_h as f64 / factor).round() as u32;
      if scaled_w <= self.window_width || scaled_h <= self.window_height {
        break;
      }

      if win_w >= params.min_size && win_h >= params.min_size {
        let ii = if factor == 1.0 {
          IntegralImage::new(gray)
        } else {
          IntegralImage::new(&imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
        };
        let step = if factor > 2.0 { 1 } else { 2 };
        for y in (0..scaled_h - self.window_height).step_by(step) {
          for x in (0..scaled_w - self.window_width).step_by(step) {
            if self.evaluate_window(&ii, x, y) {
              found.push(BoundingBox::new(
                (x as f64 * factor).round() as u32,
                (y as f64 * factor).round() as u32,
                win_w,
                win_h,
              ));
            }
          }
        }
      }

      factor *= params.scale_factor;
    }
    found
  }
}

impl FaceDetector for HaarCascade {
  fn detect(&self, gray: &GrayImage, params: &DetectionParameters) -> Vec<BoundingBox> {
    group_rectangles(self.detect_raw(gray, params), params.min_neighbors, GROUP_EPS)
  }
}

/// 积分图与平方积分图，尺寸为 (w+1)x(h+1)
pub(crate) struct IntegralImage {
  stride: usize,
  sum: Vec<u64>,
  sq_sum: Vec<u64>,
}

impl IntegralImage {
  pub(crate) fn new(image: &GrayImage) -> Self {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let stride = w + 1;
    let mut sum = vec![0u64; stride * (h + 1)];
    let mut sq_sum = vec![0u64; stride * (h + 1)];
    for y in 0..h {
      let (mut row, mut sq_row) = (0u64, 0u64);
      for x in 0..w {
        let v = image.get_pixel(x as u32, y as u32)[0] as u64;
        row += v;
        sq_row += v * v;
        let idx = (y + 1) * stride + x + 1;
        sum[idx] = sum[idx - stride] + row;
        sq_sum[idx] = sq_sum[idx - stride] + sq_row;
      }
    }
    Self { stride, sum, sq_sum }
  }

  fn lookup(&self, table: &[u64], x: u32, y: u32, w: u32, h: u32) -> u64 {
    let (x0, y0) = (x as usize, y as usize);
    let (x1, y1) = (x0 + w as usize, y0 + h as usize);
    table[y1 * self.stride + x1] + table[y0 * self.stride + x0]
      - table[y0 * self.stride + x1]
      - table[y1 * self.stride + x0]
  }

  pub(crate) fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
    self.lookup(&self.sum, x, y, w, h)
  }

  pub(crate) fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
    self.lookup(&self.sq_sum, x, y, w, h)
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use image::Luma;

  /// 4x4 窗口，右半减左半的单特征级联，对竖直亮边响应
  pub(crate) const EDGE_CASCADE: &str = include_str!("../../tests/fixtures/edge_cascade.xml");

  fn edge_image() -> GrayImage {
    GrayImage::from_fn(40, 12, |x, _| if x >= 20 { Luma([255]) } else { Luma([0]) })
  }

  fn params(min_neighbors: u32, min_size: u32) -> DetectionParameters {
    DetectionParameters {
      scale_factor: 1.1,
      min_neighbors,
      min_size,
    }
  }

  #[test]
  fn parses_edge_cascade() {
    let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
    assert_eq!(cascade.window_size(), (4, 4));
    assert_eq!(cascade.stages.len(), 1);
    assert_eq!(cascade.features[0].rects.len(), 2);
    approx::assert_relative_eq!(cascade.stages[0].threshold, 0.5 - 1e-5);
  }

  #[test]
  fn detects_vertical_edge() {
    let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
    let boxes = cascade.detect(&edge_image(), &params(0, 4));
    assert!(!boxes.is_empty());
    for b in &boxes {
      assert!(b.x <= 24 && b.right() >= 16, "{:?} 远离亮边", b);
      assert!(b.right() <= 40 && b.bottom() <= 12);
    }
    // 原始尺度下 x=18 的窗口跨越亮边
    assert!(boxes.contains(&BoundingBox::new(18, 0, 4, 4)));
  }

  #[test]
  fn uniform_image_has_no_detections() {
    let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
    let gray = GrayImage::from_pixel(40, 12, Luma([128]));
    assert!(cascade.detect(&gray, &params(0, 4)).is_empty());
  }

  #[test]
  fn min_size_larger_than_image_finds_nothing() {
    let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
    assert!(cascade.detect(&edge_image(), &params(0, 100)).is_empty());
  }

  #[test]
  fn image_smaller_than_window_finds_nothing() {
    let cascade = HaarCascade::from_xml(EDGE_CASCADE).unwrap();
    let gray = GrayImage::new(3, 3);
    assert!(cascade.detect(&gray, &params(0, 1)).is_empty());
  }

  #[test]
  fn integral_image_sums() {
    let gray = GrayImage::from_fn(3, 2, |x, y| Luma([(x + 3 * y) as u8]));
    let ii = IntegralImage::new(&gray);
    assert_eq!(ii.sum(0, 0, 3, 2), 15);
    assert_eq!(ii.sum(1, 1, 2, 1), 4 + 5);
    assert_eq!(ii.sq_sum(0, 0, 2, 1), 1);
  }

  #[test]
  fn rejects_non_xml() {
    assert!(matches!(HaarCascade::from_xml("not xml"), Err(CascadeError::Xml(_))));
  }

  #[test]
  fn rejects_old_format() {
    let xml = r#"<opencv_storage><haarcascade_frontalface type_id="opencv-haar-classifier"/></opencv_storage>"#;
    assert!(matches!(HaarCascade::from_xml(xml), Err(CascadeError::Unsupported(_))));
  }

  #[test]
  fn rejects_lbp_cascade() {
    let xml = EDGE_CASCADE.replace("<featureType>HAAR", "<featureType>LBP");
    assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Unsupported(_))));
  }

  #[test]
  fn rejects_feature_index_out_of_range() {
    let xml = EDGE_CASCADE.replace("0 -1 0 1.0e-01", "0 -1 3 1.0e-01");
    assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
  }

  #[test]
  fn rejects_rect_outside_window() {
    let xml = EDGE_CASCADE.replace("2 0 2 4 1.", "3 0 2 4 1.");
    assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
  }

  #[test]
  fn rejects_leaf_out_of_range() {
    let xml = EDGE_CASCADE.replace("0 -1 0 1.0e-01", "0 -2 0 1.0e-01");
    assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
  }

  #[rstest::rstest]
  #[case::huge_negative_link("0 -3e9 0 1.0e-01")]
  #[case::huge_positive_link("3e9 -1 0 1.0e-01")]
  #[case::fractional_link("0 -1.5 0 1.0e-01")]
  #[case::fractional_feature("0 -1 0.5 1.0e-01")]
  #[case::negative_feature("0 -1 -1 1.0e-01")]
  #[case::not_a_number("0 -1 nan 1.0e-01")]
  fn rejects_invalid_tree_fields(#[case] nodes: &str) {
    let xml = EDGE_CASCADE.replace("0 -1 0 1.0e-01", nodes);
    assert!(matches!(HaarCascade::from_xml(&xml), Err(CascadeError::Malformed(_))));
  }
}
