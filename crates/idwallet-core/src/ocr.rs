use image::RgbImage;

use crate::detector::ProviderError;

/// Text recognized in one image, concatenated in reading order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognizedText {
    pub text: String,
}

impl RecognizedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// External OCR capability.
///
/// Failures are recoverable: the caller simply tries again on the next frame.
pub trait OcrProvider: Send {
    fn process(&mut self, image: &RgbImage) -> Result<RecognizedText, ProviderError>;
}
