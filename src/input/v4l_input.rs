// 该文件是 Yeshi （夜视） 项目的一部分。
// src/input/v4l_input.rs - V4L2 摄像头输入
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
use std::pin::Pin;

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::{info, warn};
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::video::capture::Parameters;

use super::{CaptureSettings, CaptureSource, ReadFailure};
use crate::frame::Frame;

const BUFFER_COUNT: u32 = 4;

#[derive(Error, Debug)]
pub enum V4lInputError {
  #[error("无法打开设备 {device}: {source}")]
  Open {
    device: String,
    source: std::io::Error,
  },
  #[error("无法读取设备格式: {0}")]
  Format(std::io::Error),
  #[error("无法创建捕获流: {0}")]
  Stream(std::io::Error),
  #[error("不支持的像素格式: {0}")]
  UnsupportedPixelFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelLayout {
  Yuyv,
  Mjpeg,
}

/// V4L2 摄像头输入源
///
/// v4l 的 Stream 需要引用 Device，这里用 Pin<Box<Device>> 固定设备的内存地址，
/// 从而可以安全地在同一个结构体里保存引用它的 Stream。
pub struct V4lInput {
  /// V4L2 设备（使用 Pin<Box> 固定内存位置）
  device: Pin<Box<Device>>,
  /// 捕获流（生命周期与 device 关联）
  stream: Option<Stream<'static>>,
  layout: PixelLayout,
  width: u32,
  height: u32,
  frame_index: u64,
}

impl V4lInput {
  pub fn open_index(index: u32, settings: &CaptureSettings) -> Result<Self, V4lInputError> {
    let device = Device::new(index as usize).map_err(|source| V4lInputError::Open {
      device: format!("/dev/video{}", index),
      source,
    })?;
    Self::with_device(device, settings)
  }

  pub fn open_path(path: &Path, settings: &CaptureSettings) -> Result<Self, V4lInputError> {
    let device = Device::with_path(path).map_err(|source| V4lInputError::Open {
      device: path.display().to_string(),
      source,
    })?;
    Self::with_device(device, settings)
  }

  fn with_device(device: Device, settings: &CaptureSettings) -> Result<Self, V4lInputError> {
    let device = Box::pin(device);

    // 设置视频格式，宽高只是建议值
    let current = device.format().map_err(V4lInputError::Format)?;
    let mut requested = current.clone();
    requested.width = settings.width.unwrap_or(current.width);
    requested.height = settings.height.unwrap_or(current.height);
    requested.fourcc = FourCC::new(b"YUYV");

    let format = match device.set_format(&requested) {
      Ok(format) => format,
      Err(e) => {
        warn!("设备拒绝请求的格式，沿用当前格式: {}", e);
        current
      }
    };

    if format.width != requested.width || format.height != requested.height {
      warn!(
        "请求分辨率 {}x{}，设备实际使用 {}x{}",
        requested.width, requested.height, format.width, format.height
      );
    }

    let layout = match &format.fourcc.repr {
      b"YUYV" => PixelLayout::Yuyv,
      b"MJPG" => PixelLayout::Mjpeg,
      _ => {
        return Err(V4lInputError::UnsupportedPixelFormat(
          format.fourcc.to_string(),
        ));
      }
    };

    if let Some(fps) = settings.fps {
      if let Err(e) = device.set_params(&Parameters::with_fps(fps)) {
        warn!("无法设置帧率 {}，沿用设备默认值: {}", fps, e);
      }
    }

    let mut source = Self {
      device,
      stream: None,
      layout,
      width: format.width,
      height: format.height,
      frame_index: 0,
    };

    // SAFETY: device 被 Pin<Box> 固定在堆上，不会移动；
    // stream 存储在同一个结构体中，并在 Drop 中先于 device 释放。
    let device_ref: &Device = &source.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, BUFFER_COUNT)
        .map_err(V4lInputError::Stream)?
    };
    source.stream = Some(stream);

    info!(
      "V4L2 设备已打开: {}x{} {:?}",
      source.width, source.height, source.layout
    );
    Ok(source)
  }

  fn decode(layout: PixelLayout, data: &[u8], width: u32, height: u32) -> Result<RgbImage, ReadFailure> {
    match layout {
      PixelLayout::Yuyv => {
        let expected = (width * height * 2) as usize;
        if data.len() < expected {
          return Err(ReadFailure::ShortBuffer {
            expected,
            actual: data.len(),
          });
        }
        let rgb = yuyv_to_rgb(&data[..expected], width, height);
        RgbImage::from_raw(width, height, rgb)
          .ok_or_else(|| ReadFailure::Decode("无法创建 RGB 图像".to_string()))
      }
      PixelLayout::Mjpeg => image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| ReadFailure::Decode(e.to_string())),
    }
  }
}

/// 将 YUYV 格式转换为 RGB
/// 缓冲区中本次出队实际写入的部分；空帧视为读取失败，不解码上一帧残留的数据
fn payload(buffer: &[u8], bytesused: u32) -> Result<&[u8], ReadFailure> {
  if bytesused == 0 {
    return Err(ReadFailure::ShortBuffer {
      expected: buffer.len(),
      actual: 0,
    });
  }
  let used = (bytesused as usize).min(buffer.len());
  Ok(&buffer[..used])
}

fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks_exact(4) {
    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    for y in [y0, y1] {
      let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
      rgb.extend_from_slice(&[r, g, b]);
    }
  }

  rgb
}

impl Drop for V4lInput {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
  }
}

impl CaptureSource for V4lInput {
  fn read_frame(&mut self) -> Result<Frame, ReadFailure> {
    let (layout, width, height) = (self.layout, self.width, self.height);
    let stream = self
      .stream
      .as_mut()
      .ok_or_else(|| ReadFailure::Backend("捕获流已关闭".to_string()))?;

    let (buffer, meta) = stream.next()?;
    let data = payload(buffer, meta.bytesused)?;

    let image = Self::decode(layout, data, width, height)?;
    let frame = Frame::new(image, self.frame_index);
    self.frame_index += 1;
    Ok(frame)
  }

  fn release(mut self) {
    self.stream.take();
    info!("V4L2 设备已释放");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn yuyv_gray_maps_to_gray_rgb() {
    // Y=128, U=V=128 为中性灰
    let yuyv = [128u8, 128, 128, 128];
    assert_eq!(yuyv_to_rgb(&yuyv, 2, 1), vec![128, 128, 128, 128, 128, 128]);
  }

  #[test]
  fn short_yuyv_buffer_is_a_read_failure() {
    let err = V4lInput::decode(PixelLayout::Yuyv, &[0u8; 6], 2, 2).unwrap_err();
    assert!(matches!(
      err,
      ReadFailure::ShortBuffer {
        expected: 8,
        actual: 6
      }
    ));
  }

  #[test]
  fn empty_dequeue_is_a_read_failure() {
    let stale = [7u8; 8];
    assert!(matches!(
      payload(&stale, 0),
      Err(ReadFailure::ShortBuffer {
        expected: 8,
        actual: 0
      })
    ));
    assert_eq!(payload(&stale, 5).unwrap().len(), 5);
    assert_eq!(payload(&stale, 100).unwrap().len(), 8);
  }

  #[test]
  fn corrupt_mjpeg_is_a_read_failure() {
    let err = V4lInput::decode(PixelLayout::Mjpeg, b"not a jpeg", 2, 2).unwrap_err();
    assert!(matches!(err, ReadFailure::Decode(_)));
  }
}
