//! Common types for the sketch orchestrator
//!
//! This module defines the value types exchanged between the router, the engines
//! and the configuration layer.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine id of the always-available deterministic engine
pub const DETERMINISTIC_ENGINE_ID: &str = "deterministic";

/// Engine id of the tensor-graph runtime
pub const TENSOR_ENGINE_ID: &str = "tensor";

/// Engine id of the model-pipeline runtime
pub const PIPELINE_ENGINE_ID: &str = "pipeline";

/// Style the router runs on the deterministic engine when a whole chain failed
pub const SAFETY_NET_STYLE: &str = "pencil";

/// Row-major RGBA8 image
#[derive(Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl ImageBuffer {
    /// Creates an image, checking that `pixels.len() == width * height * 4`
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidImage(format!(
                "image dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }

        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(Error::InvalidImage(format!(
                "expected {} bytes for {}x{} RGBA8, got {}",
                expected,
                width,
                height,
                pixels.len()
            )));
        }

        Ok(Self { width, height, pixels })
    }

    /// Creates an image filled with a single RGBA colour
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self> {
        let count = width as usize * height as usize;
        let mut pixels = Vec::with_capacity(count * 4);
        for _ in 0..count {
            pixels.extend_from_slice(&rgba);
        }
        Self::new(width, height, pixels)
    }

    /// Image width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Image height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA8 bytes
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Consumes the image and returns its RGBA8 bytes
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// Number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// RGBA value at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[idx],
            self.pixels[idx + 1],
            self.pixels[idx + 2],
            self.pixels[idx + 3],
        ]
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Quality level of a model or of a tier's default output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    /// Smallest models, fastest output
    Low,
    /// Balanced models
    Medium,
    /// Large models
    High,
    /// Largest models, accelerated hardware only
    Ultra,
}

impl QualityLevel {
    /// All levels, weakest first
    pub const ALL: [QualityLevel; 4] = [
        QualityLevel::Low,
        QualityLevel::Medium,
        QualityLevel::High,
        QualityLevel::Ultra,
    ];

    /// The next lower level, if any
    pub fn lower(self) -> Option<QualityLevel> {
        match self {
            QualityLevel::Low => None,
            QualityLevel::Medium => Some(QualityLevel::Low),
            QualityLevel::High => Some(QualityLevel::Medium),
            QualityLevel::Ultra => Some(QualityLevel::High),
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLevel::Low => write!(f, "low"),
            QualityLevel::Medium => write!(f, "medium"),
            QualityLevel::High => write!(f, "high"),
            QualityLevel::Ultra => write!(f, "ultra"),
        }
    }
}

impl FromStr for QualityLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(QualityLevel::Low),
            "medium" | "med" => Ok(QualityLevel::Medium),
            "high" => Ok(QualityLevel::High),
            "ultra" => Ok(QualityLevel::Ultra),
            _ => Err(format!("Unknown quality level: {}", s)),
        }
    }
}

/// Network connection class hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionClass {
    /// Nothing is known about the connection
    Unknown,
    /// Very slow mobile link
    Slow2g,
    /// 2G-class link
    Cellular2g,
    /// 3G-class link
    Cellular3g,
    /// 4G-class link or better
    Cellular4g,
    /// Wired or Wi-Fi broadband
    Broadband,
}

impl ConnectionClass {
    /// Returns true for links where multi-megabyte downloads are impractical
    pub fn is_constrained(&self) -> bool {
        matches!(self, ConnectionClass::Slow2g | ConnectionClass::Cellular2g)
    }
}

impl fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionClass::Unknown => write!(f, "unknown"),
            ConnectionClass::Slow2g => write!(f, "slow-2g"),
            ConnectionClass::Cellular2g => write!(f, "2g"),
            ConnectionClass::Cellular3g => write!(f, "3g"),
            ConnectionClass::Cellular4g => write!(f, "4g"),
            ConnectionClass::Broadband => write!(f, "broadband"),
        }
    }
}

impl FromStr for ConnectionClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" | "" => Ok(ConnectionClass::Unknown),
            "slow-2g" | "slow_2g" | "slow2g" => Ok(ConnectionClass::Slow2g),
            "2g" => Ok(ConnectionClass::Cellular2g),
            "3g" => Ok(ConnectionClass::Cellular3g),
            "4g" | "5g" => Ok(ConnectionClass::Cellular4g),
            "broadband" | "wifi" | "ethernet" => Ok(ConnectionClass::Broadband),
            _ => Err(format!("Unknown connection class: {}", s)),
        }
    }
}

/// Engine a style is routed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EngineTarget {
    /// Resolve to the active tier's preferred engine
    Auto,
    /// A specific engine id
    Engine(String),
}

impl EngineTarget {
    /// Returns the explicit engine id, if any
    pub fn engine_id(&self) -> Option<&str> {
        match self {
            EngineTarget::Auto => None,
            EngineTarget::Engine(id) => Some(id),
        }
    }

    /// Returns true if this target is the deterministic engine
    pub fn is_deterministic(&self) -> bool {
        self.engine_id() == Some(DETERMINISTIC_ENGINE_ID)
    }
}

impl From<String> for EngineTarget {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("auto") {
            EngineTarget::Auto
        } else {
            EngineTarget::Engine(value)
        }
    }
}

impl From<&str> for EngineTarget {
    fn from(value: &str) -> Self {
        EngineTarget::from(value.to_string())
    }
}

impl From<EngineTarget> for String {
    fn from(value: EngineTarget) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EngineTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineTarget::Auto => write!(f, "auto"),
            EngineTarget::Engine(id) => write!(f, "{}", id),
        }
    }
}

/// Caller-supplied options for a single processing request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Quality override; the active tier's level is used when absent
    pub quality: Option<QualityLevel>,
    /// Stroke intensity in `[0, 1]`
    pub intensity: f32,
    /// Whether strokes are drawn dark on light (true) or light on dark
    pub invert: bool,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            quality: None,
            intensity: 0.5,
            invert: true,
        }
    }
}

impl ProcessingOptions {
    /// Intensity clamped to `[0, 1]`
    pub fn clamped_intensity(&self) -> f32 {
        if self.intensity.is_nan() {
            0.5
        } else {
            self.intensity.clamp(0.0, 1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_buffer_validates_length() {
        assert!(ImageBuffer::new(2, 2, vec![0; 16]).is_ok());
        assert!(matches!(
            ImageBuffer::new(2, 2, vec![0; 15]),
            Err(Error::InvalidImage(_))
        ));
        assert!(matches!(
            ImageBuffer::new(0, 2, vec![]),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_image_pixel_access() {
        let img = ImageBuffer::filled(3, 2, [10, 20, 30, 255]).unwrap();
        assert_eq!(img.pixel_count(), 6);
        assert_eq!(img.pixel(2, 1), [10, 20, 30, 255]);
    }

    #[test]
    fn test_engine_target_parsing() {
        assert_eq!(EngineTarget::from("auto"), EngineTarget::Auto);
        assert_eq!(EngineTarget::from("AUTO"), EngineTarget::Auto);
        assert_eq!(
            EngineTarget::from("tensor"),
            EngineTarget::Engine("tensor".to_string())
        );
        assert!(EngineTarget::from(DETERMINISTIC_ENGINE_ID).is_deterministic());

        let json = serde_json::to_string(&EngineTarget::Auto).unwrap();
        assert_eq!(json, "\"auto\"");
        let parsed: EngineTarget = serde_json::from_str("\"pipeline\"").unwrap();
        assert_eq!(parsed.engine_id(), Some("pipeline"));
    }

    #[test]
    fn test_quality_level_order() {
        assert!(QualityLevel::Ultra > QualityLevel::Low);
        assert_eq!(QualityLevel::High.lower(), Some(QualityLevel::Medium));
        assert_eq!(QualityLevel::Low.lower(), None);
        assert_eq!("ULTRA".parse::<QualityLevel>(), Ok(QualityLevel::Ultra));
    }

    #[test]
    fn test_connection_class() {
        assert_eq!("3g".parse::<ConnectionClass>(), Ok(ConnectionClass::Cellular3g));
        assert!(ConnectionClass::Slow2g.is_constrained());
        assert!(!ConnectionClass::Broadband.is_constrained());
    }

    #[test]
    fn test_intensity_clamp() {
        let mut options = ProcessingOptions::default();
        options.intensity = 4.0;
        assert_eq!(options.clamped_intensity(), 1.0);
        options.intensity = f32::NAN;
        assert_eq!(options.clamped_intensity(), 0.5);
    }
}
