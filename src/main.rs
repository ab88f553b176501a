// 该文件是 Yeshi （夜视） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use yeshi::{
  args::Args,
  config::{Config, HealthCheckConfig},
  input::DefaultOpener,
  task::{ContinuousTask, ExitStatus, HealthCheckTask, ShutdownSignal},
  telemetry::{self, Telemetry},
};

/// 创建日志与输出目录并安装日志
fn setup(args: &Args) -> Result<()> {
  std::fs::create_dir_all(&args.log_dir)
    .with_context(|| format!("无法创建日志目录 {}", args.log_dir.display()))?;
  std::fs::create_dir_all(&args.output_dir)
    .with_context(|| format!("无法创建输出目录 {}", args.output_dir.display()))?;
  telemetry::init_logging(&args.log_dir).context("无法初始化日志")?;
  Ok(())
}

fn main() -> ExitCode {
  let args = Args::parse();

  if let Err(e) = setup(&args) {
    eprintln!("启动失败: {:#}", e);
    return ExitStatus::SetupFailed.into();
  }

  if let Some(health) = HealthCheckConfig::from_args(&args) {
    info!("执行健康检查: {}", health.source);
    return HealthCheckTask::new(DefaultOpener, health.source, health.capture)
      .run()
      .into();
  }

  let config = match Config::from_args(&args) {
    Ok(config) => config,
    Err(e) => {
      error!("配置无效: {}", e);
      return ExitStatus::InvalidConfig.into();
    }
  };

  info!("Yeshi 低照度人脸监控");
  info!("视频源: {}", config.source);
  info!("级联目录: {}", config.cascade_dir.display());
  info!("输出目录: {}", config.output_dir.display());
  info!(
    "检测参数: scale_factor={} min_neighbors={} min_size={}",
    config.detection.scale_factor, config.detection.min_neighbors, config.detection.min_size
  );
  info!(
    "预处理: alpha={} beta={} 均衡={:?}",
    config.preprocess.alpha, config.preprocess.beta, config.preprocess.equalization
  );

  let mut telemetry = Telemetry::new();
  let mut shutdown = ShutdownSignal::install();
  let report = ContinuousTask::new(
    DefaultOpener,
    config.detector_loader(),
    config.pipeline_options(),
  )
  .run(&mut telemetry, &mut shutdown);

  info!("任务完成，退出码 {}", report.status.code());
  report.status.into()
}
