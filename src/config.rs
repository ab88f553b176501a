// 该文件是 Yeshi （夜视） 项目的一部分。
// src/config.rs - 运行配置校验与拆分
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
use std::time::Duration;

use thiserror::Error;

use crate::args::Args;
use crate::detector::{CascadeLoader, DetectionParameters};
use crate::input::CaptureSettings;
use crate::preprocess::{Equalization, PreprocessConfig};
use crate::task::{DEFAULT_READ_BACKOFF, PipelineOptions};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
  #[error("缩放步长必须大于 1，当前为 {0}")]
  ScaleFactor(f64),
  #[error("亮度增益必须大于 0，当前为 {0}")]
  BrightenAlpha(f32),
  #[error("保存间隔必须是非负有限秒数，当前为 {0}")]
  SaveInterval(f64),
  #[error("最小人脸边长至少为 1 像素")]
  MinSize,
}

/// 校验后的运行配置，启动时构建一次
#[derive(Debug, Clone)]
pub struct Config {
  pub source: String,
  pub capture: CaptureSettings,
  pub preprocess: PreprocessConfig,
  pub detection: DetectionParameters,
  pub use_profile: bool,
  pub cascade_dir: PathBuf,
  pub log_dir: PathBuf,
  pub output_dir: PathBuf,
  pub save_interval: Duration,
  pub max_frames: Option<u64>,
  pub max_read_failures: Option<u32>,
}

/// 健康检查只需要视频源与采集参数，不经过检测与保存相关的校验
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckConfig {
  pub source: String,
  pub capture: CaptureSettings,
}

impl HealthCheckConfig {
  /// 未指定 `--health-check` 时返回 `None`
  pub fn from_args(args: &Args) -> Option<Self> {
    args.health_check.then(|| Self {
      source: args.source.clone(),
      capture: CaptureSettings::from_raw(args.width, args.height, args.fps),
    })
  }
}

impl Config {
  pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
    if !(args.scale_factor.is_finite() && args.scale_factor > 1.0) {
      return Err(ConfigError::ScaleFactor(args.scale_factor));
    }
    if !(args.brighten_alpha.is_finite() && args.brighten_alpha > 0.0) {
      return Err(ConfigError::BrightenAlpha(args.brighten_alpha));
    }
    if args.min_size == 0 {
      return Err(ConfigError::MinSize);
    }
    let save_interval = Duration::try_from_secs_f64(args.save_interval)
      .map_err(|_| ConfigError::SaveInterval(args.save_interval))?;

    let equalization = if args.no_equalize {
      Equalization::None
    } else if args.clahe {
      Equalization::clahe()
    } else {
      Equalization::Global
    };

    Ok(Self {
      source: args.source.clone(),
      capture: CaptureSettings::from_raw(args.width, args.height, args.fps),
      preprocess: PreprocessConfig {
        alpha: args.brighten_alpha,
        beta: args.brighten_beta,
        equalization,
      },
      detection: DetectionParameters {
        scale_factor: args.scale_factor,
        min_neighbors: args.min_neighbors,
        min_size: args.min_size,
      },
      use_profile: args.use_profile,
      cascade_dir: args.cascade_dir.clone(),
      log_dir: args.log_dir.clone(),
      output_dir: args.output_dir.clone(),
      save_interval,
      max_frames: (args.max_frames > 0).then_some(args.max_frames),
      max_read_failures: (args.max_read_failures > 0).then_some(args.max_read_failures),
    })
  }

  pub fn pipeline_options(&self) -> PipelineOptions {
    PipelineOptions {
      source: self.source.clone(),
      capture: self.capture,
      preprocess: self.preprocess,
      detection: self.detection,
      output_dir: self.output_dir.clone(),
      save_interval: self.save_interval,
      max_frames: self.max_frames,
      read_backoff: DEFAULT_READ_BACKOFF,
      max_read_failures: self.max_read_failures,
    }
  }

  pub fn detector_loader(&self) -> CascadeLoader {
    CascadeLoader {
      cascade_dir: self.cascade_dir.clone(),
      use_profile: self.use_profile,
    }
  }
}
