// 该文件是 Yeshi （夜视） 项目的一部分。
// src/args.rs - 项目参数配置
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

use clap::Parser;

/// Yeshi 低照度人脸监控
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 视频源：摄像头编号（如 0）、/dev/videoN、v4l2:// 路径、
  /// rtsp:// / http:// / file:// 等 URI，或本地视频文件
  #[arg(long, alias = "rtsp-url", default_value = "0", value_name = "SOURCE")]
  pub source: String,

  /// 保存标注帧的最小间隔（秒）
  #[arg(long, default_value_t = 5.0, value_name = "SECONDS")]
  pub save_interval: f64,

  /// 最大处理帧数（0 表示无限制）
  #[arg(long, default_value_t = 0, value_name = "COUNT")]
  pub max_frames: u64,

  /// 仅检查视频源能否打开并读取一帧
  #[arg(long)]
  pub health_check: bool,

  /// 检测窗口缩放步长（必须大于 1）
  #[arg(long, default_value_t = 1.05, value_name = "FACTOR")]
  pub scale_factor: f64,

  /// 候选区域被接受所需的最少邻居数
  #[arg(long, default_value_t = 3, value_name = "COUNT")]
  pub min_neighbors: u32,

  /// 最小人脸边长（像素）
  #[arg(long, default_value_t = 20, value_name = "PIXELS")]
  pub min_size: u32,

  /// 亮度增益
  #[arg(long, default_value_t = 1.6, value_name = "ALPHA")]
  pub brighten_alpha: f32,

  /// 亮度偏移
  #[arg(long, default_value_t = 35, allow_hyphen_values = true, value_name = "BETA")]
  pub brighten_beta: i32,

  /// 使用 CLAHE 代替全局直方图均衡
  #[arg(long, conflicts_with = "no_equalize")]
  pub clahe: bool,

  /// 跳过直方图均衡
  #[arg(long)]
  pub no_equalize: bool,

  /// 采集宽度（0 表示使用默认值）
  #[arg(long, default_value_t = 0, value_name = "PIXELS")]
  pub width: u32,

  /// 采集高度（0 表示使用默认值）
  #[arg(long, default_value_t = 0, value_name = "PIXELS")]
  pub height: u32,

  /// 采集帧率（0 表示使用默认值）
  #[arg(long, default_value_t = 0, value_name = "FPS")]
  pub fps: u32,

  /// 同时运行侧脸检测器
  #[arg(long)]
  pub use_profile: bool,

  /// 级联文件目录
  #[arg(long, env = "CASCADE_DIR", default_value = "cascades", value_name = "DIR")]
  pub cascade_dir: PathBuf,

  /// 日志目录
  #[arg(long, env = "LOG_DIR", default_value = "logs", value_name = "DIR")]
  pub log_dir: PathBuf,

  /// 标注帧输出目录
  #[arg(long, env = "OUTPUT_DIR", default_value = "output", value_name = "DIR")]
  pub output_dir: PathBuf,

  /// 连续读取失败次数上限（0 表示无限重试）
  #[arg(long, default_value_t = 0, value_name = "COUNT")]
  pub max_read_failures: u32,
}
