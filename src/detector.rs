// 该文件是 Yeshi （夜视） 项目的一部分。
// src/detector.rs - 人脸检测器集合
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

use std::path::{Path, PathBuf};

use image::GrayImage;
use thiserror::Error;
use tracing::{info, warn};

mod grouping;
pub mod haar;

pub use self::grouping::group_rectangles;
pub use self::haar::{CascadeError, HaarCascade};

pub const FRONTAL_CASCADE: &str = "haarcascade_frontalface_default.xml";
pub const PROFILE_CASCADE: &str = "haarcascade_profileface.xml";

/// 侧脸检测的放宽下限
const PROFILE_MIN_SCALE_FACTOR: f64 = 1.05;
const PROFILE_MIN_NEIGHBORS: u32 = 3;

/// 检测框，左上角为原点，单位为像素
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundingBox {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl BoundingBox {
  pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  pub fn right(&self) -> u32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> u32 {
    self.y + self.height
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParameters {
  /// 相邻检测窗口尺寸的几何步长，必须大于 1
  pub scale_factor: f64,
  /// 候选区域被接受所需的最少邻居数
  pub min_neighbors: u32,
  /// 最小人脸边长（像素）
  pub min_size: u32,
}

impl Default for DetectionParameters {
  fn default() -> Self {
    Self {
      scale_factor: 1.05,
      min_neighbors: 3,
      min_size: 20,
    }
  }
}

impl DetectionParameters {
  /// 侧脸检测使用的参数：偏向召回率
  pub fn relaxed(&self) -> Self {
    Self {
      scale_factor: self.scale_factor.max(PROFILE_MIN_SCALE_FACTOR),
      min_neighbors: self
        .min_neighbors
        .saturating_sub(1)
        .max(PROFILE_MIN_NEIGHBORS),
      min_size: self.min_size,
    }
  }
}

/// 单帧检测结果：先正脸后侧脸，不做重叠抑制
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionResult {
  pub items: Vec<BoundingBox>,
}

impl DetectionResult {
  pub fn iter(&self) -> std::slice::Iter<'_, BoundingBox> {
    self.items.iter()
  }
}

pub trait FaceDetector {
  fn detect(&self, gray: &GrayImage, params: &DetectionParameters) -> Vec<BoundingBox>;
}

pub struct DetectorSet {
  frontal: Box<dyn FaceDetector>,
  profile: Option<Box<dyn FaceDetector>>,
}

impl DetectorSet {
  pub fn new(frontal: Box<dyn FaceDetector>, profile: Option<Box<dyn FaceDetector>>) -> Self {
    Self { frontal, profile }
  }

  pub fn has_profile(&self) -> bool {
    self.profile.is_some()
  }

  pub fn fuse(&self, gray: &GrayImage, params: &DetectionParameters) -> DetectionResult {
    let mut items = self.frontal.detect(gray, params);
    if let Some(profile) = &self.profile {
      items.extend(profile.detect(gray, &params.relaxed()));
    }
    DetectionResult { items }
  }
}

#[derive(Error, Debug)]
pub enum DetectorLoadError {
  #[error("无法读取级联文件 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("级联文件 {path} 无效: {source}")]
  Cascade {
    path: PathBuf,
    source: CascadeError,
  },
}

/// 启动时加载检测器集合
pub trait DetectorLoader {
  fn load(&self) -> Result<DetectorSet, DetectorLoadError>;
}

impl<F> DetectorLoader for F
where
  F: Fn() -> Result<DetectorSet, DetectorLoadError>,
{
  fn load(&self) -> Result<DetectorSet, DetectorLoadError> {
    self()
  }
}

/// 从级联目录加载 OpenCV 格式的 Haar 级联
#[derive(Debug, Clone)]
pub struct CascadeLoader {
  pub cascade_dir: PathBuf,
  pub use_profile: bool,
}

impl DetectorLoader for CascadeLoader {
  fn load(&self) -> Result<DetectorSet, DetectorLoadError> {
    load_detectors(&self.cascade_dir, self.use_profile)
  }
}

/// 正脸级联加载失败是致命错误；侧脸级联加载失败只记录警告
pub fn load_detectors(cascade_dir: &Path, use_profile: bool) -> Result<DetectorSet, DetectorLoadError> {
  let frontal_path = cascade_dir.join(FRONTAL_CASCADE);
  let frontal = HaarCascade::from_file(&frontal_path)?;
  info!("正脸级联已加载: {}", frontal_path.display());

  let profile: Option<Box<dyn FaceDetector>> = if use_profile {
    let profile_path = cascade_dir.join(PROFILE_CASCADE);
    match HaarCascade::from_file(&profile_path) {
      Ok(cascade) => {
        info!("侧脸级联已加载: {}", profile_path.display());
        Some(Box::new(cascade))
      }
      Err(e) => {
        warn!("侧脸级联不可用，仅使用正脸检测器继续运行: {}", e);
        None
      }
    }
  } else {
    None
  };

  Ok(DetectorSet::new(Box::new(frontal), profile))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::RefCell;
  use std::rc::Rc;

  struct Scripted {
    boxes: Vec<BoundingBox>,
    seen: Rc<RefCell<Vec<DetectionParameters>>>,
  }

  impl FaceDetector for Scripted {
    fn detect(&self, _gray: &GrayImage, params: &DetectionParameters) -> Vec<BoundingBox> {
      self.seen.borrow_mut().push(*params);
      self.boxes.clone()
    }
  }

  fn scripted(boxes: Vec<BoundingBox>) -> (Box<dyn FaceDetector>, Rc<RefCell<Vec<DetectionParameters>>>) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    (
      Box::new(Scripted {
        boxes,
        seen: seen.clone(),
      }),
      seen,
    )
  }

  #[test]
  fn fuse_concatenates_frontal_then_profile() {
    let frontal_boxes = vec![BoundingBox::new(1, 1, 20, 20), BoundingBox::new(50, 5, 30, 30)];
    // 与第一个正脸框重叠，但不会被抑制
    let profile_boxes = vec![BoundingBox::new(2, 1, 20, 20)];
    let (frontal, _) = scripted(frontal_boxes.clone());
    let (profile, _) = scripted(profile_boxes.clone());

    let set = DetectorSet::new(frontal, Some(profile));
    let result = set.fuse(&GrayImage::new(8, 8), &DetectionParameters::default());

    assert_eq!(result.items.len(), 3);
    assert_eq!(&result.items[..2], &frontal_boxes[..]);
    assert_eq!(&result.items[2..], &profile_boxes[..]);
  }

  #[test]
  fn fuse_without_profile_is_frontal_only() {
    let (frontal, _) = scripted(vec![BoundingBox::new(0, 0, 10, 10)]);
    let set = DetectorSet::new(frontal, None);
    assert!(!set.has_profile());
    let result = set.fuse(&GrayImage::new(8, 8), &DetectionParameters::default());
    assert_eq!(result.items, vec![BoundingBox::new(0, 0, 10, 10)]);
  }

  #[test]
  fn profile_gets_relaxed_parameters() {
    let (frontal, frontal_seen) = scripted(vec![]);
    let (profile, profile_seen) = scripted(vec![]);
    let set = DetectorSet::new(frontal, Some(profile));
    let params = DetectionParameters {
      scale_factor: 1.01,
      min_neighbors: 6,
      min_size: 40,
    };

    set.fuse(&GrayImage::new(8, 8), &params);

    assert_eq!(frontal_seen.borrow().as_slice(), &[params]);
    assert_eq!(
      profile_seen.borrow().as_slice(),
      &[DetectionParameters {
        scale_factor: 1.05,
        min_neighbors: 5,
        min_size: 40,
      }]
    );
  }

  #[test]
  fn relaxed_parameters_have_floors() {
    let relaxed = DetectionParameters {
      scale_factor: 1.3,
      min_neighbors: 0,
      min_size: 20,
    }
    .relaxed();
    assert_eq!(relaxed.scale_factor, 1.3);
    assert_eq!(relaxed.min_neighbors, 3);
  }

  #[test]
  fn missing_frontal_cascade_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
      load_detectors(dir.path(), false),
      Err(DetectorLoadError::Io { .. })
    ));
  }

  #[test]
  fn missing_profile_cascade_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(FRONTAL_CASCADE), haar::tests::EDGE_CASCADE).unwrap();

    let set = load_detectors(dir.path(), true).unwrap();
    assert!(!set.has_profile());
  }

  #[test]
  fn profile_cascade_loaded_when_present() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(FRONTAL_CASCADE), haar::tests::EDGE_CASCADE).unwrap();
    std::fs::write(dir.path().join(PROFILE_CASCADE), haar::tests::EDGE_CASCADE).unwrap();

    let set = CascadeLoader {
      cascade_dir: dir.path().to_path_buf(),
      use_profile: true,
    }
    .load()
    .unwrap();
    assert!(set.has_profile());
  }
}
