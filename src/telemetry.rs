// 该文件是 Yeshi （夜视） 项目的一部分。
// src/telemetry.rs - 日志初始化与运行指标输出
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

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

pub const LOG_FILE: &str = "app.log";

#[derive(Error, Debug)]
pub enum TelemetryError {
  #[error("无法打开日志文件: {0}")]
  IoError(#[from] std::io::Error),
  #[error("日志系统初始化失败: {0}")]
  InitError(#[from] TryInitError),
}

/// 安装全局日志：控制台与 `<log_dir>/app.log`（追加写入），级别 INFO。
/// 进程内只应调用一次。
pub fn init_logging(log_dir: &Path) -> Result<(), TelemetryError> {
  std::fs::create_dir_all(log_dir)?;
  let file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(log_dir.join(LOG_FILE))?;

  let console = fmt::layer().with_writer(std::io::stdout).with_target(false);
  let file = fmt::layer()
    .with_writer(Mutex::new(file))
    .with_ansi(false)
    .with_target(false);

  tracing_subscriber::registry()
    .with(LevelFilter::INFO)
    .with(console)
    .with(file)
    .try_init()?;
  Ok(())
}

fn round2(v: f64) -> f64 {
  (v * 100.0).round() / 100.0
}

/// 运行期结束时的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
  pub frames: u64,
  pub saved: u64,
  pub read_failures: u64,
  pub save_failures: u64,
  /// 从 `Streaming` 进入 `Degraded` 的次数
  pub degraded_episodes: u64,
}

/// 结构化指标输出。由 `main` 创建一次，以可变引用传入控制器。
#[derive(Debug, Default)]
pub struct Telemetry {
  last_fps: Option<f64>,
}

impl Telemetry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn connected(&self, source: &str) {
    info!(source, "已连接视频源");
  }

  /// `elapsed` 为增强、检测与标注耗时；`latency` 为从采集到标注完成的总时延
  pub fn frame(&self, frame: u64, faces: usize, elapsed: Duration, latency: Duration) {
    let infer_ms = round2(elapsed.as_secs_f64() * 1000.0);
    let latency_ms = round2(latency.as_secs_f64() * 1000.0);
    info!(frame, faces, infer_ms, latency_ms, "帧处理完成");
  }

  pub fn fps(&mut self, fps: f64) {
    self.last_fps = Some(fps);
    info!(fps = round2(fps), "吞吐量");
  }

  pub fn read_failed(&self, consecutive: u32, reason: &dyn std::fmt::Display) {
    warn!(consecutive, "读取帧失败，稍后重试: {}", reason);
  }

  pub fn saved(&self, path: &Path, saved: u64) {
    info!(path = %path.display(), saved, "已保存标注帧");
  }

  pub fn save_failed(&self, reason: &dyn std::fmt::Display) {
    error!("保存标注帧失败，继续运行: {}", reason);
  }

  pub fn state_changed(&self, from: &dyn std::fmt::Debug, to: &dyn std::fmt::Debug) {
    debug!("状态切换: {:?} -> {:?}", from, to);
  }

  pub fn summary(&self, summary: &RunSummary) {
    info!(
      frames = summary.frames,
      saved = summary.saved,
      read_failures = summary.read_failures,
      save_failures = summary.save_failures,
      degraded_episodes = summary.degraded_episodes,
      last_fps = self.last_fps.map(round2),
      "运行结束"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sink_tracks_emitted_metrics() {
    let mut telemetry = Telemetry::new();
    assert!(telemetry.last_fps.is_none());
    telemetry.frame(1, 2, Duration::from_millis(12), Duration::from_millis(15));
    telemetry.fps(9.0);
    telemetry.fps(14.5);

    approx::assert_relative_eq!(telemetry.last_fps.unwrap(), 14.5);
  }

  #[test]
  fn logging_creates_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");
    // 其他测试可能已经安装了全局订阅者，此时只检查文件
    let _ = init_logging(&log_dir);
    assert!(log_dir.join(LOG_FILE).exists());
  }
}
