//! Day/night classification of camera frames.
//!
//! A frame is labelled by its mean luminance: the image is reduced to a
//! single 8-bit luma channel and averaged over every pixel. Frames at or
//! above the threshold are daytime frames.

use bytes::Bytes;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default mean-luminance threshold on a 0-255 scale.
pub const DEFAULT_BRIGHTNESS_THRESHOLD: f64 = 50.0;

/// Errors that can occur while classifying a frame.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Image could not be decoded: {0}")]
    Undecodable(#[from] image::ImageError),

    #[error("Image has no pixels")]
    EmptyImage,
}

/// Day/night label attached to every persisted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Classification {
    Day,
    Night,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Day => "day",
            Classification::Night => "night",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Classification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "day" => Ok(Classification::Day),
            "night" => Ok(Classification::Night),
            other => Err(format!("unknown classification '{}'", other)),
        }
    }
}

/// Result of classifying a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLabel {
    pub classification: Classification,
    /// Mean luminance, absent when the image could not be read
    pub brightness: Option<f64>,
}

/// Brightness-threshold frame classifier.
#[derive(Debug, Clone, Copy)]
pub struct FrameClassifier {
    threshold: f64,
}

impl FrameClassifier {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Classify a decoded image.
    pub fn classify(&self, image: &DynamicImage) -> Result<FrameLabel, ClassificationError> {
        let brightness = mean_luminance(image)?;
        let classification = if brightness >= self.threshold {
            Classification::Day
        } else {
            Classification::Night
        };

        Ok(FrameLabel {
            classification,
            brightness: Some(brightness),
        })
    }

    /// Decode and classify an encoded image (JPEG, PNG).
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<FrameLabel, ClassificationError> {
        let image = image::load_from_memory(bytes)?;
        self.classify(&image)
    }

    /// Classify, falling back to `Day` when the image cannot be read.
    ///
    /// Ingestion must never be aborted by a bad frame; a mislabelled frame
    /// costs one timelapse slot at worst.
    pub fn classify_or_default(&self, bytes: &[u8]) -> FrameLabel {
        match self.classify_bytes(bytes) {
            Ok(label) => {
                debug!(
                    classification = %label.classification,
                    brightness = label.brightness,
                    "Frame classified"
                );
                label
            }
            Err(e) => {
                warn!(error = %e, "Frame classification failed, defaulting to day");
                metrics::counter!("telemetry.frames.classification_fallback").increment(1);
                FrameLabel {
                    classification: Classification::Day,
                    brightness: None,
                }
            }
        }
    }
}

impl FrameClassifier {
    /// [`classify_or_default`](Self::classify_or_default) on the blocking
    /// thread pool, keeping image decoding off the async workers.
    pub async fn classify_off_runtime(&self, bytes: Bytes) -> FrameLabel {
        let classifier = *self;
        match tokio::task::spawn_blocking(move || classifier.classify_or_default(&bytes)).await {
            Ok(label) => label,
            Err(e) => {
                warn!(error = %e, "Classification task failed, defaulting to day");
                metrics::counter!("telemetry.frames.classification_fallback").increment(1);
                FrameLabel {
                    classification: Classification::Day,
                    brightness: None,
                }
            }
        }
    }
}

impl Default for FrameClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_BRIGHTNESS_THRESHOLD)
    }
}

/// Arithmetic mean of the 8-bit luma channel over all pixels.
pub fn mean_luminance(image: &DynamicImage) -> Result<f64, ClassificationError> {
    let luma = image.to_luma8();
    let pixel_count = luma.width() as u64 * luma.height() as u64;
    if pixel_count == 0 {
        return Err(ClassificationError::EmptyImage);
    }

    let total: u64 = luma.pixels().map(|p| p.0[0] as u64).sum();
    Ok(total as f64 / pixel_count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageOutputFormat, Luma, Rgb, RgbImage};
    use std::io::Cursor;

    fn gray(value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([value])))
    }

    fn encode_png(image: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn test_black_image_is_night() {
        let label = FrameClassifier::default().classify(&gray(0)).unwrap();
        assert_eq!(label.classification, Classification::Night);
        assert_eq!(label.brightness, Some(0.0));
    }

    #[test]
    fn test_white_image_is_day() {
        let label = FrameClassifier::default().classify(&gray(255)).unwrap();
        assert_eq!(label.classification, Classification::Day);
        assert_eq!(label.brightness, Some(255.0));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let classifier = FrameClassifier::default();
        assert_eq!(
            classifier.classify(&gray(50)).unwrap().classification,
            Classification::Day
        );
        assert_eq!(
            classifier.classify(&gray(49)).unwrap().classification,
            Classification::Night
        );
    }

    #[test]
    fn test_mean_over_mixed_pixels() {
        // Half black, half 100: mean 50 lands exactly on the threshold
        let mut img = GrayImage::new(4, 2);
        for (x, _, px) in img.enumerate_pixels_mut() {
            *px = Luma([if x < 2 { 0 } else { 100 }]);
        }
        let image = DynamicImage::ImageLuma8(img);

        assert_eq!(mean_luminance(&image).unwrap(), 50.0);
        assert_eq!(
            FrameClassifier::default().classify(&image).unwrap().classification,
            Classification::Day
        );
    }

    #[test]
    fn test_color_image_uses_luminance() {
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])));
        let label = FrameClassifier::default()
            .classify_bytes(&encode_png(&white))
            .unwrap();
        assert_eq!(label.classification, Classification::Day);
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let empty = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(matches!(
            FrameClassifier::default().classify(&empty),
            Err(ClassificationError::EmptyImage)
        ));
    }

    #[test]
    fn test_undecodable_bytes_fall_back_to_day() {
        let classifier = FrameClassifier::default();
        assert!(classifier.classify_bytes(b"not an image").is_err());

        let label = classifier.classify_or_default(b"not an image");
        assert_eq!(label.classification, Classification::Day);
        assert_eq!(label.brightness, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_classify_off_runtime_matches_inline() {
        let classifier = FrameClassifier::default();
        let night = Bytes::from(encode_png(&gray(10)));
        let day = Bytes::from(encode_png(&gray(200)));

        let label = classifier.classify_off_runtime(night.clone()).await;
        assert_eq!(label, classifier.classify_or_default(&night));
        assert_eq!(label.classification, Classification::Night);

        assert_eq!(classifier.classify_off_runtime(day).await.classification, Classification::Day);
        assert_eq!(
            classifier
                .classify_off_runtime(Bytes::from_static(b"junk"))
                .await
                .classification,
            Classification::Day
        );
    }

    #[test]
    fn test_classification_parsing() {
        assert_eq!("Night".parse::<Classification>().unwrap(), Classification::Night);
        assert_eq!(Classification::Day.to_string(), "day");
        assert!("dusk".parse::<Classification>().is_err());
    }
}
