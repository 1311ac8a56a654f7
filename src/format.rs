//! Frame geometry, pixel formats and pixel conversion helpers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("unknown pixel format: {0}")]
    UnknownPixelFormat(String),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },
}

/// Fixed per-pixel byte layout of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PixelFormat {
    /// 16-bit RGB 5:6:5, little-endian words (V4L2 `RGBP`)
    Rgb565,
    /// 16-bit RGB 5:6:5, big-endian words. This is what the camera boards put on
    /// the wire and what their displays call BGR565.
    Bgr565,
    /// Packed YUV 4:2:2
    Yuyv,
    /// 24-bit RGB 8:8:8
    Rgb24,
    /// 8-bit luminance
    Grey,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 | PixelFormat::Bgr565 | PixelFormat::Yuyv => 2,
            PixelFormat::Rgb24 => 3,
            PixelFormat::Grey => 1,
        }
    }

    /// Four character code used when negotiating with the driver
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb565 => *b"RGBP",
            PixelFormat::Bgr565 => *b"RGBR",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Grey => *b"GREY",
        }
    }

    pub fn from_fourcc(code: &[u8; 4]) -> Option<Self> {
        [
            PixelFormat::Rgb565,
            PixelFormat::Bgr565,
            PixelFormat::Yuyv,
            PixelFormat::Rgb24,
            PixelFormat::Grey,
        ]
        .into_iter()
        .find(|f| &f.fourcc() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelFormat::Rgb565 => "RGB565",
            PixelFormat::Bgr565 => "BGR565",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Grey => "GREY",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "RGB565" => Ok(PixelFormat::Rgb565),
            "BGR565" | "RGB565X" => Ok(PixelFormat::Bgr565),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
            "RGB24" | "RGB888" => Ok(PixelFormat::Rgb24),
            "GREY" | "GRAY" | "GRAY8" => Ok(PixelFormat::Grey),
            _ => {
                // Fall back to a raw fourcc, which is case sensitive
                let bytes = s.trim().as_bytes();
                if bytes.len() == 4 {
                    let code = [bytes[0], bytes[1], bytes[2], bytes[3]];
                    if let Some(format) = PixelFormat::from_fourcc(&code) {
                        return Ok(format);
                    }
                }
                Err(FormatError::UnknownPixelFormat(s.to_string()))
            }
        }
    }
}

impl TryFrom<String> for PixelFormat {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PixelFormat> for String {
    fn from(format: PixelFormat) -> Self {
        format.name().to_string()
    }
}

/// Agreed width, height and pixel format of every frame in a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, FormatError> {
        if width == 0 || height == 0 {
            return Err(FormatError::InvalidGeometry(format!(
                "width and height must be > 0, got {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            format,
        })
    }

    /// Bytes per row
    pub fn pitch(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Bytes per frame; the exact payload length sent to clients
    pub fn frame_size(&self) -> usize {
        self.pitch() * self.height as usize
    }
}

impl fmt::Display for FrameGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

/// A frame interval as numerator/denominator seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Frames per second represented by this interval
    pub fn fps(&self) -> f64 {
        if self.numerator == 0 {
            return 0.0;
        }
        self.denominator as f64 / self.numerator as f64
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Frame interval supported by a camera for the negotiated format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameInterval {
    Discrete(Fraction),
    Stepwise {
        min: Fraction,
        max: Fraction,
        step: Fraction,
    },
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameInterval::Discrete(interval) => write!(f, "{}", interval),
            FrameInterval::Stepwise { min, max, step } => {
                write!(f, "[min = {}; max = {}; step = {}]", min, max, step)
            }
        }
    }
}

/// Converts one frame to packed RGB888.
///
/// `dst` must hold at least `width * height * 3` bytes.
pub fn to_rgb888(geometry: &FrameGeometry, src: &[u8], dst: &mut [u8]) -> Result<(), FormatError> {
    let pixels = geometry.width as usize * geometry.height as usize;
    let needed_src = geometry.frame_size();
    if src.len() < needed_src {
        return Err(FormatError::BufferTooSmall {
            needed: needed_src,
            actual: src.len(),
        });
    }
    if dst.len() < pixels * 3 {
        return Err(FormatError::BufferTooSmall {
            needed: pixels * 3,
            actual: dst.len(),
        });
    }

    let src = &src[..needed_src];
    let dst = &mut dst[..pixels * 3];

    match geometry.format {
        PixelFormat::Rgb565 => {
            for (px, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(3)) {
                out.copy_from_slice(&rgb565_to_rgb888(u16::from_le_bytes([px[0], px[1]])));
            }
        }
        PixelFormat::Bgr565 => {
            for (px, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(3)) {
                out.copy_from_slice(&rgb565_to_rgb888(u16::from_be_bytes([px[0], px[1]])));
            }
        }
        PixelFormat::Rgb24 => dst.copy_from_slice(src),
        PixelFormat::Grey => {
            for (&y, out) in src.iter().zip(dst.chunks_exact_mut(3)) {
                out.fill(y);
            }
        }
        PixelFormat::Yuyv => {
            // Each 4-byte group carries two pixels sharing chroma
            for (group, out) in src.chunks_exact(4).zip(dst.chunks_exact_mut(6)) {
                let (u, v) = (group[1], group[3]);
                out[..3].copy_from_slice(&yuv_to_rgb(group[0], u, v));
                out[3..].copy_from_slice(&yuv_to_rgb(group[2], u, v));
            }
        }
    }

    Ok(())
}

/// Expands a 5:6:5 word to 8 bits per channel, replicating the high bits
pub fn rgb565_to_rgb888(word: u16) -> [u8; 3] {
    let r = ((word >> 11) & 0x1F) as u8;
    let g = ((word >> 5) & 0x3F) as u8;
    let b = (word & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

/// Packs 8-bit channels into a 5:6:5 word
pub fn rgb888_to_rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

// BT.601 integer approximation
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}
