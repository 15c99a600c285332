//! Input tensor and image size types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of the model input in NCHW order.
///
/// Serialized as a four-element array (`[1, 3, 224, 224]`) so it reads the
/// same in TOML, JSON and the request sent to the Python side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[usize; 4]", into = "[usize; 4]")]
pub struct InputShape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputShape {
    pub const fn new(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch,
            channels,
            height,
            width,
        }
    }

    pub fn dims(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }

    /// Number of scalar elements in a tensor of this shape.
    pub fn element_count(&self) -> usize {
        self.dims().iter().product()
    }

    /// Size in bytes of an `f32` tensor of this shape.
    pub fn f32_byte_len(&self) -> usize {
        self.element_count() * std::mem::size_of::<f32>()
    }

    pub fn is_degenerate(&self) -> bool {
        self.dims().contains(&0)
    }
}

impl Default for InputShape {
    fn default() -> Self {
        Self::new(1, 3, 224, 224)
    }
}

impl From<[usize; 4]> for InputShape {
    fn from(d: [usize; 4]) -> Self {
        Self::new(d[0], d[1], d[2], d[3])
    }
}

impl From<InputShape> for [usize; 4] {
    fn from(s: InputShape) -> Self {
        s.dims()
    }
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.batch, self.channels, self.height, self.width
        )
    }
}

/// Target spatial size for resized calibration images, `[width, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// The single-image NCHW input shape this size produces.
    pub fn input_shape(&self) -> InputShape {
        InputShape::new(1, 3, self.height as usize, self.width as usize)
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::new(224, 224)
    }
}

impl From<[u32; 2]> for ImageSize {
    fn from(d: [u32; 2]) -> Self {
        Self::new(d[0], d[1])
    }
}

impl From<ImageSize> for [u32; 2] {
    fn from(s: ImageSize) -> Self {
        [s.width, s.height]
    }
}

impl std::str::FromStr for ImageSize {
    type Err = String;

    /// Parses `224x224` or a single edge length such as `224`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|e| format!("invalid image size '{s}': {e}"))
        };
        match s.split_once(['x', 'X']) {
            Some((w, h)) => Ok(Self::new(parse(w)?, parse(h)?)),
            None => {
                let edge = parse(s)?;
                Ok(Self::new(edge, edge))
            }
        }
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shape_byte_len() {
        let shape = InputShape::default();
        assert_eq!(shape.element_count(), 3 * 224 * 224);
        assert_eq!(shape.f32_byte_len(), 602_112);
        assert!(!shape.is_degenerate());
    }

    #[test]
    fn test_shape_serde_as_array() {
        let json = serde_json::to_string(&InputShape::default()).unwrap();
        assert_eq!(json, "[1,3,224,224]");
        let parsed: InputShape = serde_json::from_str("[2,3,64,32]").unwrap();
        assert_eq!(parsed.batch, 2);
        assert_eq!(parsed.width, 32);
    }

    #[test]
    fn test_image_size_parse() {
        assert_eq!("320x240".parse::<ImageSize>().unwrap(), ImageSize::new(320, 240));
        assert_eq!("224".parse::<ImageSize>().unwrap(), ImageSize::new(224, 224));
        assert!("axb".parse::<ImageSize>().is_err());
    }

    #[test]
    fn test_image_size_input_shape_is_nchw() {
        let shape = ImageSize::new(320, 240).input_shape();
        assert_eq!(shape.dims(), [1, 3, 240, 320]);
    }
}
