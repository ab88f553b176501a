// 该文件是 Yeshi （夜视） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 网络流输入
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

//! # GStreamer 视频输入模块
//!
//! 通过 `uridecodebin` 打开 RTSP / HTTP / 本地文件等 URI，统一转换为 RGB
//! 后由 appsink 取帧：
//!
//! ```text
//! uridecodebin uri=rtsp://... ! videoconvert ! videoscale ! video/x-raw,format=RGB ! appsink
//! ```
//!
//! 宽、高、帧率只是建议值，对应 `videoscale` / `videorate` 的 caps。
//!
//! 使用前需要安装 GStreamer 开发库（`libgstreamer1.0-dev`、
//! `libgstreamer-plugins-base1.0-dev`），并启用 `gstreamer_input` 特性。

use std::time::Duration;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::{CaptureSettings, CaptureSource, ReadFailure};
use crate::{FromUrl, FromUrlWithScheme, frame::Frame};

/// 等待管道进入 PLAYING 的最长时间
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
/// 单次取帧的最长等待时间
const PULL_TIMEOUT: Duration = Duration::from_secs(5);

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// URI scheme 不受支持
  #[error("URI scheme mismatch: {0}")]
  SchemeMismatch(String),
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

pub enum GStreamerInputBuilderItem {
  UriSource(String),
  Scale { width: Option<u32>, height: Option<u32> },
  Rate { fps: u32 },
  TargetFormat { format: String },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::UriSource(uri) => {
        format!("uridecodebin uri=\"{}\" ! videoconvert", uri)
      }
      GStreamerInputBuilderItem::Scale { width, height } => {
        let mut caps = String::from("videoscale ! video/x-raw");
        if let Some(width) = width {
          caps.push_str(&format!(",width={}", width));
        }
        if let Some(height) = height {
          caps.push_str(&format!(",height={}", height));
        }
        caps
      }
      GStreamerInputBuilderItem::Rate { fps } => {
        format!("videorate ! video/x-raw,framerate={}/1", fps)
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
    }
  }
}

/// GStreamer 输入管道构建器
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
}

impl FromUrlWithScheme for GStreamerInputPipelineBuilder {
  const SCHEMES: &'static [&'static str] =
    &["rtsp", "rtsps", "rtmp", "http", "https", "file", "udp", "srt"];
}

impl FromUrl for GStreamerInputPipelineBuilder {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if !Self::accepts(url) {
      return Err(GStreamerInputError::SchemeMismatch(url.scheme().to_string()));
    }

    Ok(GStreamerInputPipelineBuilder {
      items: vec![GStreamerInputBuilderItem::UriSource(url.to_string())],
    })
  }
}

impl GStreamerInputPipelineBuilder {
  pub fn with_settings(mut self, settings: &CaptureSettings) -> Self {
    if settings.width.is_some() || settings.height.is_some() {
      self.items.push(GStreamerInputBuilderItem::Scale {
        width: settings.width,
        height: settings.height,
      });
    }
    if let Some(fps) = settings.fps {
      self.items.push(GStreamerInputBuilderItem::Rate { fps });
    }
    self
  }

  pub fn description(&self) -> String {
    let basic_pipeline = self
      .items
      .iter()
      .chain(std::iter::once(&GStreamerInputBuilderItem::TargetFormat {
        format: "RGB".to_string(),
      }))
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    format!(
      "{} ! appsink name=sink max-buffers=2 drop=true sync=false",
      basic_pipeline
    )
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let full_pipeline = self.description();
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("Failed to create pipeline".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    // 先构造，出错时由 Drop 把管道切回 NULL
    let input = GStreamerInput {
      pipeline,
      appsink,
      frame_index: 0,
    };

    input.pipeline.set_state(gst::State::Playing)?;
    let (result, _, _) = input
      .pipeline
      .state(gst::ClockTime::from_mseconds(OPEN_TIMEOUT.as_millis() as u64));
    result?;

    if let Some(message) = input.pending_error() {
      return Err(GStreamerInputError::PipelineError(message));
    }

    Ok(input)
  }
}

/// GStreamer 视频输入
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  frame_index: u64,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerInput {
  fn pending_error(&self) -> Option<String> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => Some(err.error().to_string()),
      _ => None,
    }
  }
}

impl CaptureSource for GStreamerInput {
  fn read_frame(&mut self) -> Result<Frame, ReadFailure> {
    if let Some(message) = self.pending_error() {
      return Err(ReadFailure::Backend(message));
    }

    let sample = self
      .appsink
      .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64))
      .ok_or_else(|| {
        if self.appsink.is_eos() {
          ReadFailure::EndOfStream
        } else {
          ReadFailure::Timeout
        }
      })?;

    let image = convert_sample_to_rgb(&sample)?;
    let frame = Frame::new(image, self.frame_index);
    self.frame_index += 1;
    Ok(frame)
  }

  fn release(self) {
    info!("GStreamer 管道已释放");
  }
}

fn convert_sample_to_rgb(sample: &gst::Sample) -> Result<RgbImage, ReadFailure> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| ReadFailure::Backend("No buffer in sample".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| ReadFailure::Backend("No caps in sample".to_string()))?;

  let video_info = gst_video::VideoInfo::from_caps(caps)
    .map_err(|_| ReadFailure::Decode("Failed to get video info from caps".to_string()))?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;

  let map = buffer
    .map_readable()
    .map_err(|e| ReadFailure::Backend(format!("Failed to map buffer for reading: {}", e)))?;
  let data = map.as_slice();

  // 每行可能带有对齐填充
  let expected = stride * (height.saturating_sub(1)) + width * 3;
  if data.len() < expected {
    return Err(ReadFailure::ShortBuffer {
      expected,
      actual: data.len(),
    });
  }

  let bgr = match video_info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    other => return Err(ReadFailure::Decode(format!("Unsupported video format {:?}", other))),
  };

  let mut pixels = Vec::with_capacity(width * height * 3);
  for row in data.chunks(stride).take(height) {
    let row = &row[..width * 3];
    if bgr {
      for px in row.chunks_exact(3) {
        pixels.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    } else {
      pixels.extend_from_slice(row);
    }
  }

  RgbImage::from_raw(width as u32, height as u32, pixels)
    .ok_or_else(|| ReadFailure::Decode("无法创建 RGB 图像".to_string()))
}
