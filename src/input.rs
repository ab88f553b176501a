// 该文件是 Yeshi （夜视） 项目的一部分。
// src/input.rs - 视频采集源
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

use std::{
  fmt,
  path::{Path, PathBuf},
};

use thiserror::Error;
use url::Url;

use crate::frame::Frame;

mod v4l_input;
pub use self::v4l_input::{V4lInput, V4lInputError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_input::{
  GStreamerInput, GStreamerInputError, GStreamerInputPipelineBuilder,
};

const V4L2_PREFIX: &str = "v4l2://";
const V4L2_DEVICE_PREFIX: &str = "/dev/video";

/// 采集源标识
///
/// 纯数字字符串一律视为设备序号，例如 `"0"` 对应 `/dev/video0`。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceId {
  /// 本地摄像头序号
  Device(u32),
  /// V4L2 设备路径
  DevicePath(PathBuf),
  /// 网络流或本地文件 URI
  Stream(Url),
}

impl SourceId {
  pub fn parse(raw: &str) -> Result<Self, OpenError> {
    let raw = raw.trim();
    if raw.is_empty() {
      return Err(OpenError::InvalidSource(raw.to_string()));
    }

    if raw.bytes().all(|b| b.is_ascii_digit()) {
      return raw
        .parse::<u32>()
        .map(SourceId::Device)
        .map_err(|_| OpenError::InvalidSource(raw.to_string()));
    }

    if let Some(path) = raw.strip_prefix(V4L2_PREFIX) {
      return Ok(SourceId::DevicePath(PathBuf::from(path)));
    }
    if raw.starts_with(V4L2_DEVICE_PREFIX) {
      return Ok(SourceId::DevicePath(PathBuf::from(raw)));
    }

    if let Ok(url) = Url::parse(raw) {
      return Ok(SourceId::Stream(url));
    }

    // 本地视频文件，转换为 file:// URI 交给流后端
    let path = Path::new(raw);
    if path.is_file() {
      let absolute = path.canonicalize()?;
      return Url::from_file_path(&absolute)
        .map(SourceId::Stream)
        .map_err(|_| OpenError::InvalidSource(raw.to_string()));
    }

    Err(OpenError::InvalidSource(raw.to_string()))
  }
}

impl fmt::Display for SourceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SourceId::Device(index) => write!(f, "device #{}", index),
      SourceId::DevicePath(path) => write!(f, "{}", path.display()),
      SourceId::Stream(url) => write!(f, "{}", url),
    }
  }
}

/// 建议性的采集参数，采集源无法满足时可以忽略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSettings {
  pub width: Option<u32>,
  pub height: Option<u32>,
  pub fps: Option<u32>,
}

impl CaptureSettings {
  /// 0 表示不设置
  pub fn from_raw(width: u32, height: u32, fps: u32) -> Self {
    let non_zero = |v: u32| (v > 0).then_some(v);
    Self {
      width: non_zero(width),
      height: non_zero(height),
      fps: non_zero(fps),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.width.is_none() && self.height.is_none() && self.fps.is_none()
  }
}

#[derive(Error, Debug)]
pub enum OpenError {
  #[error("无效的输入来源: {0:?}")]
  InvalidSource(String),
  #[error("不支持的输入来源: {0}")]
  Unsupported(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("V4L2 输入错误: {0}")]
  V4lInputError(#[from] V4lInputError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 输入错误: {0}")]
  GStreamerInputError(#[from] GStreamerInputError),
}

/// 单帧读取失败，属于可重试的瞬时错误
#[derive(Error, Debug)]
pub enum ReadFailure {
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("读取超时")]
  Timeout,
  #[error("视频流已结束")]
  EndOfStream,
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  ShortBuffer { expected: usize, actual: usize },
  #[error("帧解码失败: {0}")]
  Decode(String),
  #[error("采集后端错误: {0}")]
  Backend(String),
}

/// 已打开的采集源
pub trait CaptureSource {
  fn read_frame(&mut self) -> Result<Frame, ReadFailure>;

  /// 释放采集源，消耗所有权，保证只释放一次
  fn release(self)
  where
    Self: Sized,
  {
  }
}

/// 采集源工厂
pub trait SourceOpener {
  type Source: CaptureSource;

  fn open(&self, source: &str, settings: &CaptureSettings) -> Result<Self::Source, OpenError>;
}

pub enum InputWrapper {
  V4l(V4lInput),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerInput),
}

impl CaptureSource for InputWrapper {
  fn read_frame(&mut self) -> Result<Frame, ReadFailure> {
    match self {
      InputWrapper::V4l(input) => input.read_frame(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.read_frame(),
    }
  }

  fn release(self) {
    match self {
      InputWrapper::V4l(input) => input.release(),
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(input) => input.release(),
    }
  }
}

/// 根据标识选择 V4L2 或 GStreamer 后端
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOpener;

impl SourceOpener for DefaultOpener {
  type Source = InputWrapper;

  fn open(&self, source: &str, settings: &CaptureSettings) -> Result<Self::Source, OpenError> {
    match SourceId::parse(source)? {
      SourceId::Device(index) => Ok(InputWrapper::V4l(V4lInput::open_index(index, settings)?)),
      SourceId::DevicePath(path) => Ok(InputWrapper::V4l(V4lInput::open_path(&path, settings)?)),
      SourceId::Stream(url) => open_stream(&url, settings),
    }
  }
}

#[cfg(feature = "gstreamer_input")]
fn open_stream(url: &Url, settings: &CaptureSettings) -> Result<InputWrapper, OpenError> {
  use crate::FromUrl;

  let input = GStreamerInputPipelineBuilder::from_url(url)?
    .with_settings(settings)
    .build()?;
  Ok(InputWrapper::GStreamer(input))
}

#[cfg(not(feature = "gstreamer_input"))]
fn open_stream(url: &Url, _settings: &CaptureSettings) -> Result<InputWrapper, OpenError> {
  Err(OpenError::Unsupported(format!(
    "{} (编译时未启用 gstreamer_input 特性)",
    url
  )))
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[rstest]
  #[case("0", 0)]
  #[case("2", 2)]
  #[case(" 1 ", 1)]
  fn numeric_identifier_is_device_index(#[case] raw: &str, #[case] index: u32) {
    assert_eq!(SourceId::parse(raw).unwrap(), SourceId::Device(index));
  }

  #[test]
  fn device_paths_are_v4l2() {
    assert_eq!(
      SourceId::parse("/dev/video3").unwrap(),
      SourceId::DevicePath(PathBuf::from("/dev/video3"))
    );
    assert_eq!(
      SourceId::parse("v4l2:///dev/video1").unwrap(),
      SourceId::DevicePath(PathBuf::from("/dev/video1"))
    );
  }

  #[test]
  fn rtsp_url_is_stream() {
    let id = SourceId::parse("rtsp://10.0.0.5:554/live").unwrap();
    match id {
      SourceId::Stream(url) => {
        assert_eq!(url.scheme(), "rtsp");
        assert_eq!(url.host_str(), Some("10.0.0.5"));
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn local_file_becomes_file_uri() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.mp4");
    std::fs::write(&path, b"not really a video").unwrap();

    match SourceId::parse(path.to_str().unwrap()).unwrap() {
      SourceId::Stream(url) => assert_eq!(url.scheme(), "file"),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[rstest]
  #[case("")]
  #[case("no-such-camera")]
  fn garbage_identifier_is_rejected(#[case] raw: &str) {
    assert!(matches!(
      SourceId::parse(raw),
      Err(OpenError::InvalidSource(_))
    ));
  }

  #[test]
  fn zero_settings_are_unset() {
    let settings = CaptureSettings::from_raw(0, 720, 0);
    assert_eq!(settings.width, None);
    assert_eq!(settings.height, Some(720));
    assert_eq!(settings.fps, None);
    assert!(CaptureSettings::from_raw(0, 0, 0).is_empty());
  }
}
