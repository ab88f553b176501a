// 该文件是 Yeshi （夜视） 项目的一部分。
// src/task.rs - 流水线控制器与健康检查
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
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};
use std::thread;

use tracing::{error, info, warn};

use crate::detector::{DetectionParameters, DetectorLoader, DetectorSet};
use crate::frame::Frame;
use crate::input::{CaptureSettings, CaptureSource, SourceOpener};
use crate::output::{PersistenceGate, SaveOutcome, annotate};
use crate::preprocess::{self, PreprocessConfig};
use crate::telemetry::{RunSummary, Telemetry};

/// 读取失败后的等待时间
pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_millis(200);

const FPS_WINDOW: Duration = Duration::from_secs(1);
const FORCE_EXIT_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Uninitialized,
  Connecting,
  Streaming,
  /// 读取失败后的短暂子状态，下一次成功读取即回到 `Streaming`
  Degraded,
  ShuttingDown,
  Terminated,
}

/// 进程退出状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
  Success,
  HealthOpenFailed,
  HealthReadFailed,
  DetectorLoadFailed,
  SourceOpenFailed,
  ReadFailuresExhausted,
  InvalidConfig,
  /// 无法创建输出/日志目录或初始化日志
  SetupFailed,
}

impl ExitStatus {
  pub fn code(self) -> u8 {
    match self {
      ExitStatus::Success => 0,
      ExitStatus::HealthOpenFailed => 1,
      ExitStatus::HealthReadFailed => 2,
      ExitStatus::DetectorLoadFailed => 3,
      ExitStatus::SourceOpenFailed => 4,
      ExitStatus::ReadFailuresExhausted => 5,
      ExitStatus::InvalidConfig => 64,
      ExitStatus::SetupFailed => 73,
    }
  }
}

impl From<ExitStatus> for ExitCode {
  fn from(status: ExitStatus) -> Self {
    ExitCode::from(status.code())
  }
}

/// 运行期计数器，只在进程启动时清零
#[derive(Debug, Clone)]
pub struct RuntimeStats {
  pub frames: u64,
  pub saved: u64,
  pub read_failures: u64,
  pub save_failures: u64,
  pub consecutive_failures: u32,
  pub degraded_episodes: u64,
  fps_window_start: Instant,
  fps_window_frames: u64,
}

impl RuntimeStats {
  pub fn new(now: Instant) -> Self {
    Self {
      frames: 0,
      saved: 0,
      read_failures: 0,
      save_failures: 0,
      consecutive_failures: 0,
      degraded_episodes: 0,
      fps_window_start: now,
      fps_window_frames: 0,
    }
  }

  /// 记录一帧处理完成；窗口满一秒时返回该窗口的平均帧率并重新开窗
  pub fn record_frame(&mut self, now: Instant) -> Option<f64> {
    self.frames += 1;
    self.fps_window_frames += 1;
    self.consecutive_failures = 0;

    let elapsed = now.saturating_duration_since(self.fps_window_start);
    if elapsed < FPS_WINDOW {
      return None;
    }
    let fps = self.fps_window_frames as f64 / elapsed.as_secs_f64();
    self.fps_window_start = now;
    self.fps_window_frames = 0;
    Some(fps)
  }

  /// 记录一次读取失败，返回连续失败次数。连续失败的第一次计为一次降级。
  pub fn record_read_failure(&mut self) -> u32 {
    self.read_failures += 1;
    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    if self.consecutive_failures == 1 {
      self.degraded_episodes += 1;
    }
    self.consecutive_failures
  }

  pub fn summary(&self) -> RunSummary {
    RunSummary {
      frames: self.frames,
      saved: self.saved,
      read_failures: self.read_failures,
      save_failures: self.save_failures,
      degraded_episodes: self.degraded_episodes,
    }
  }
}

/// 中断信号。一旦收到即保持触发状态，控制器在两次迭代之间轮询。
pub struct ShutdownSignal {
  rx: Receiver<()>,
  triggered: bool,
}

impl ShutdownSignal {
  pub fn channel() -> (Sender<()>, Self) {
    let (tx, rx) = mpsc::channel();
    (tx, Self { rx, triggered: false })
  }

  /// 安装 Ctrl-C 处理器。收到信号 30 秒后仍未退出则强制结束进程。
  pub fn install() -> Self {
    let (tx, signal) = Self::channel();
    ctrlc::set_handler(move || {
      info!("收到中断信号，准备退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(FORCE_EXIT_AFTER);
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .expect("Error setting Ctrl-C handler");
    signal
  }

  pub fn is_triggered(&mut self) -> bool {
    if !self.triggered && self.rx.try_recv().is_ok() {
      self.triggered = true;
    }
    self.triggered
  }
}

/// 流水线选项，由 `Config` 拆分得到
#[derive(Debug, Clone)]
pub struct PipelineOptions {
  pub source: String,
  pub capture: CaptureSettings,
  pub preprocess: PreprocessConfig,
  pub detection: DetectionParameters,
  pub output_dir: PathBuf,
  pub save_interval: Duration,
  pub max_frames: Option<u64>,
  pub read_backoff: Duration,
  pub max_read_failures: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
  pub status: ExitStatus,
  pub summary: RunSummary,
  /// 到达过的状态，按首次进入的顺序，每个状态只记一次
  pub states: Vec<PipelineState>,
  final_state: PipelineState,
}

impl RunReport {
  pub fn final_state(&self) -> PipelineState {
    self.final_state
  }
}

pub struct ContinuousTask<O, L> {
  opener: O,
  loader: L,
  options: PipelineOptions,
  state: PipelineState,
  states: Vec<PipelineState>,
}

impl<O: SourceOpener, L: DetectorLoader> ContinuousTask<O, L> {
  pub fn new(opener: O, loader: L, options: PipelineOptions) -> Self {
    Self {
      opener,
      loader,
      options,
      state: PipelineState::Uninitialized,
      states: vec![PipelineState::Uninitialized],
    }
  }

  fn transition(&mut self, to: PipelineState, telemetry: &Telemetry) {
    if self.state == to {
      return;
    }
    telemetry.state_changed(&self.state, &to);
    self.state = to;
    if !self.states.contains(&to) {
      self.states.push(to);
    }
  }

  fn finish(mut self, status: ExitStatus, stats: &RuntimeStats, telemetry: &Telemetry) -> RunReport {
    self.transition(PipelineState::Terminated, telemetry);
    let summary = stats.summary();
    telemetry.summary(&summary);
    RunReport {
      status,
      summary,
      states: self.states,
      final_state: self.state,
    }
  }

  pub fn run(mut self, telemetry: &mut Telemetry, shutdown: &mut ShutdownSignal) -> RunReport {
    info!("开始任务...");
    let mut stats = RuntimeStats::new(Instant::now());
    self.transition(PipelineState::Connecting, telemetry);

    let detectors = match self.loader.load() {
      Ok(detectors) => detectors,
      Err(e) => {
        error!("无法加载正脸检测器: {}", e);
        return self.finish(ExitStatus::DetectorLoadFailed, &stats, telemetry);
      }
    };

    let mut source = match self.opener.open(&self.options.source, &self.options.capture) {
      Ok(source) => source,
      Err(e) => {
        error!("无法打开视频源 {}: {}", self.options.source, e);
        return self.finish(ExitStatus::SourceOpenFailed, &stats, telemetry);
      }
    };
    telemetry.connected(&self.options.source);
    self.transition(PipelineState::Streaming, telemetry);

    let mut gate = PersistenceGate::new(&self.options.output_dir, self.options.save_interval);
    let status = loop {
      if shutdown.is_triggered() {
        warn!("中断信号接收，退出任务循环");
        break ExitStatus::Success;
      }

      let frame = match source.read_frame() {
        Ok(frame) => frame,
        Err(e) => {
          let consecutive = stats.record_read_failure();
          self.transition(PipelineState::Degraded, telemetry);
          telemetry.read_failed(consecutive, &e);
          if self.options.max_read_failures.is_some_and(|max| consecutive >= max) {
            error!("连续 {} 次读取失败，停止运行", consecutive);
            break ExitStatus::ReadFailuresExhausted;
          }
          thread::sleep(self.options.read_backoff);
          continue;
        }
      };
      self.transition(PipelineState::Streaming, telemetry);

      self.process(frame, &detectors, &mut gate, &mut stats, telemetry);

      if self.options.max_frames.is_some_and(|max| stats.frames >= max) {
        info!("达到指定帧数 {}, 退出任务循环", stats.frames);
        break ExitStatus::Success;
      }
    };

    self.transition(PipelineState::ShuttingDown, telemetry);
    source.release();
    self.finish(status, &stats, telemetry)
  }

  fn process(
    &self,
    frame: Frame,
    detectors: &DetectorSet,
    gate: &mut PersistenceGate,
    stats: &mut RuntimeStats,
    telemetry: &mut Telemetry,
  ) {
    let started = Instant::now();
    let enhanced = preprocess::enhance(&frame.image, &self.options.preprocess);
    let result = detectors.fuse(&enhanced.gray, &self.options.detection);
    let annotated = annotate(&enhanced.color, &result);
    let elapsed = started.elapsed();

    let now = Instant::now();
    if let Some(fps) = stats.record_frame(now) {
      telemetry.fps(fps);
    }
    let latency = now.saturating_duration_since(frame.captured_at);
    telemetry.frame(stats.frames, result.items.len(), elapsed, latency);

    match gate.offer(&annotated, now) {
      SaveOutcome::Saved(path) => {
        stats.saved += 1;
        telemetry.saved(&path, stats.saved);
      }
      SaveOutcome::Failed(e) => {
        stats.save_failures += 1;
        telemetry.save_failed(&e);
      }
      SaveOutcome::Skipped => {}
    }
  }
}

/// 打开视频源、读取一帧后释放，不加载检测器
pub struct HealthCheckTask<O> {
  opener: O,
  source: String,
  capture: CaptureSettings,
}

impl<O: SourceOpener> HealthCheckTask<O> {
  pub fn new(opener: O, source: impl Into<String>, capture: CaptureSettings) -> Self {
    Self {
      opener,
      source: source.into(),
      capture,
    }
  }

  pub fn run(&self) -> ExitStatus {
    let mut source = match self.opener.open(&self.source, &self.capture) {
      Ok(source) => source,
      Err(e) => {
        error!("健康检查失败：无法打开视频源 {}: {}", self.source, e);
        return ExitStatus::HealthOpenFailed;
      }
    };

    let status = match source.read_frame() {
      Ok(frame) => {
        info!("健康检查通过 ({}x{})", frame.width(), frame.height());
        ExitStatus::Success
      }
      Err(e) => {
        error!("健康检查失败：无法读取帧: {}", e);
        ExitStatus::HealthReadFailed
      }
    };
    source.release();
    status
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exit_codes() {
    let codes: Vec<u8> = [
      ExitStatus::Success,
      ExitStatus::HealthOpenFailed,
      ExitStatus::HealthReadFailed,
      ExitStatus::DetectorLoadFailed,
      ExitStatus::SourceOpenFailed,
      ExitStatus::ReadFailuresExhausted,
      ExitStatus::InvalidConfig,
      ExitStatus::SetupFailed,
    ]
    .into_iter()
    .map(ExitStatus::code)
    .collect();
    assert_eq!(codes, vec![0, 1, 2, 3, 4, 5, 64, 73]);
  }

  #[test]
  fn fps_window_reports_once_per_second() {
    let start = Instant::now();
    let mut stats = RuntimeStats::new(start);
    let reports: Vec<f64> = (1..=25)
      .filter_map(|i| stats.record_frame(start + Duration::from_millis(i * 100)))
      .collect();

    assert_eq!(stats.frames, 25);
    assert_eq!(reports.len(), 2);
    approx::assert_relative_eq!(reports[0], 10.0);
    approx::assert_relative_eq!(reports[1], 10.0);
  }

  #[test]
  fn read_failures_reset_on_frame() {
    let now = Instant::now();
    let mut stats = RuntimeStats::new(now);
    assert_eq!(stats.record_read_failure(), 1);
    assert_eq!(stats.record_read_failure(), 2);
    stats.record_frame(now);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(stats.record_read_failure(), 1);
    assert_eq!(stats.summary().read_failures, 3);
    assert_eq!(stats.summary().frames, 1);
    assert_eq!(stats.summary().degraded_episodes, 2);
  }

  #[test]
  fn shutdown_signal_latches() {
    let (tx, mut signal) = ShutdownSignal::channel();
    assert!(!signal.is_triggered());
    tx.send(()).unwrap();
    assert!(signal.is_triggered());
    assert!(signal.is_triggered());
  }

  #[test]
  fn dropped_sender_is_not_a_shutdown() {
    let (tx, mut signal) = ShutdownSignal::channel();
    drop(tx);
    assert!(!signal.is_triggered());
  }
}
