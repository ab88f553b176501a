// 该文件是 Yeshi （夜视） 项目的一部分。
// src/output/directory_record.rs - 按时间间隔保存标注帧
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
use std::time::{Duration, Instant};

use chrono::Utc;
use image::{ImageFormat, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Debug)]
pub enum SaveOutcome {
  Saved(PathBuf),
  Skipped,
  Failed(PersistError),
}

/// 保存间隔闸门：首帧总是保存，之后两次保存的间隔不小于 `interval`
#[derive(Debug)]
pub struct PersistenceGate {
  directory: PathBuf,
  interval: Duration,
  last_save: Option<Instant>,
}

impl PersistenceGate {
  pub fn new(directory: impl Into<PathBuf>, interval: Duration) -> Self {
    Self {
      directory: directory.into(),
      interval,
      last_save: None,
    }
  }

  pub fn last_save(&self) -> Option<Instant> {
    self.last_save
  }

  pub fn should_save(&self, now: Instant) -> bool {
    match self.last_save {
      None => true,
      Some(last) => now.saturating_duration_since(last) >= self.interval,
    }
  }

  fn frame_path(&self) -> PathBuf {
    let now = Utc::now();
    self
      .directory
      .join(format!("frame_{}.jpg", now.format("%Y%m%d_%H%M%S_%6f")))
  }

  /// 每帧调用一次。写入失败同样推进 `last_save`，避免逐帧重试。
  pub fn offer(&mut self, image: &RgbImage, now: Instant) -> SaveOutcome {
    if !self.should_save(now) {
      return SaveOutcome::Skipped;
    }
    self.last_save = Some(now);

    let path = self.frame_path();
    match image.save_with_format(&path, ImageFormat::Jpeg) {
      Ok(()) => SaveOutcome::Saved(path),
      Err(e) => SaveOutcome::Failed(e.into()),
    }
  }
}
