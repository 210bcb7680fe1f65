//! Decode probe: sniff an image payload for its format and dimensions.
//!
//! The probe never decodes pixels. It reads just enough of the header to learn
//! the native size, which is what RAM and video accounting need.

use image::{ImageFormat, ImageReader};
use std::io::Cursor;

/// What a probe learns from a payload header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
}

impl ImageInfo {
    pub fn pixels(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Decode probe failure. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("unsupported image format")]
    Unsupported,
    #[error("invalid image data: {0}")]
    Invalid(String),
}

/// Resolves `{width, height, mime_type}` from raw payload bytes.
pub trait DecodeProbe {
    fn probe(&self, payload: &[u8]) -> Result<ImageInfo, DecodeError>;
}

/// Header-sniffing probe for PNG, JPEG, GIF and BMP.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderProbe;

impl HeaderProbe {
    fn mime_type(format: ImageFormat) -> Option<&'static str> {
        match format {
            ImageFormat::Png => Some("image/png"),
            ImageFormat::Jpeg => Some("image/jpeg"),
            ImageFormat::Gif => Some("image/gif"),
            ImageFormat::Bmp => Some("image/bmp"),
            _ => None,
        }
    }
}

impl DecodeProbe for HeaderProbe {
    fn probe(&self, payload: &[u8]) -> Result<ImageInfo, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }

        let reader = ImageReader::new(Cursor::new(payload))
            .with_guessed_format()
            .map_err(|e| DecodeError::Invalid(e.to_string()))?;

        let mime_type = reader
            .format()
            .and_then(Self::mime_type)
            .ok_or(DecodeError::Unsupported)?;

        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| DecodeError::Invalid(e.to_string()))?;

        Ok(ImageInfo {
            width,
            height,
            mime_type: mime_type.to_string(),
        })
    }
}
