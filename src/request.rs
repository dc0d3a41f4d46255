//! Video generation request payloads.

use crate::error::{ReelWatchError, Result};
use base64::Engine;
use rand::Rng;
use serde::Serialize;
use std::path::Path;

/// Default text-to-video model.
pub const DEFAULT_MODEL_ID: &str = "amazon.nova-reel-v1:0";

const MAX_SEED: u32 = 2_147_483_646;

/// Format of a conditioning image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG image.
    Png,
    /// JPEG image.
    Jpeg,
}

impl ImageFormat {
    /// Detects the format from the file signature.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(Self::Png)
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(Self::Jpeg)
        } else {
            None
        }
    }
}

/// A request to generate a video.
#[derive(Debug, Clone)]
pub struct VideoGenerationRequest {
    /// The text prompt describing the desired video.
    pub prompt: String,
    /// Optional first frame (raw bytes and format).
    pub image: Option<(Vec<u8>, ImageFormat)>,
    /// Video duration in seconds.
    pub duration_secs: u32,
    /// Frames per second.
    pub fps: u32,
    /// Output dimension, e.g. `1280x720`.
    pub dimension: String,
    /// Seed; a random one is drawn when unset.
    pub seed: Option<u32>,
}

impl VideoGenerationRequest {
    /// Creates a new request with the given prompt and the model defaults.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
            duration_secs: 6,
            fps: 24,
            dimension: "1280x720".to_string(),
            seed: None,
        }
    }

    /// Conditions the video on a first frame.
    pub fn with_image(mut self, data: Vec<u8>, format: ImageFormat) -> Self {
        self.image = Some((data, format));
        self
    }

    /// Reads the first frame from a PNG or JPEG file.
    pub fn with_image_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let format = ImageFormat::detect(&data).ok_or_else(|| {
            ReelWatchError::InvalidRequest(format!(
                "{} is neither PNG nor JPEG",
                path.display()
            ))
        })?;
        Ok(self.with_image(data, format))
    }

    /// Sets the video duration in seconds.
    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Sets the frame rate.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Sets the output dimension.
    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimension = dimension.into();
        self
    }

    /// Sets the seed for reproducible output.
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the `TEXT_VIDEO` model input, drawing a random seed if none was set.
    pub fn to_model_input(&self) -> Result<serde_json::Value> {
        if self.prompt.trim().is_empty() {
            return Err(ReelWatchError::InvalidRequest("prompt must not be empty".into()));
        }
        let seed = match self.seed {
            Some(seed) if seed > MAX_SEED => {
                return Err(ReelWatchError::InvalidRequest(format!(
                    "seed must be at most {MAX_SEED}"
                )))
            }
            Some(seed) => seed,
            None => rand::rng().random_range(0..=MAX_SEED),
        };

        let images = self.image.as_ref().map(|(data, format)| {
            vec![ImageInput {
                format: *format,
                source: ImageSource {
                    bytes: base64::engine::general_purpose::STANDARD.encode(data),
                },
            }]
        });

        let input = TextToVideoInput {
            task_type: "TEXT_VIDEO",
            text_to_video_params: TextToVideoParams {
                text: &self.prompt,
                images,
            },
            video_generation_config: VideoGenerationConfig {
                duration_seconds: self.duration_secs,
                fps: self.fps,
                dimension: &self.dimension,
                seed,
            },
        };
        Ok(serde_json::to_value(input)?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TextToVideoInput<'a> {
    task_type: &'static str,
    text_to_video_params: TextToVideoParams<'a>,
    video_generation_config: VideoGenerationConfig<'a>,
}

#[derive(Serialize)]
struct TextToVideoParams<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<ImageInput>>,
}

#[derive(Serialize)]
struct ImageInput {
    format: ImageFormat,
    source: ImageSource,
}

#[derive(Serialize)]
struct ImageSource {
    bytes: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoGenerationConfig<'a> {
    duration_seconds: u32,
    fps: u32,
    dimension: &'a str,
    seed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_to_video_payload() {
        let input = VideoGenerationRequest::new("Closeup of a large seashell in the sand")
            .with_seed(42)
            .to_model_input()
            .unwrap();

        assert_eq!(
            input,
            json!({
                "taskType": "TEXT_VIDEO",
                "textToVideoParams": {"text": "Closeup of a large seashell in the sand"},
                "videoGenerationConfig": {
                    "durationSeconds": 6,
                    "fps": 24,
                    "dimension": "1280x720",
                    "seed": 42
                }
            })
        );
    }

    #[test]
    fn test_image_conditioned_payload() {
        let png = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A];
        let input = VideoGenerationRequest::new("Snow in a forest clearing")
            .with_image(png.clone(), ImageFormat::Png)
            .with_seed(7)
            .to_model_input()
            .unwrap();

        let images = &input["textToVideoParams"]["images"];
        assert_eq!(images[0]["format"], "png");
        assert_eq!(
            images[0]["source"]["bytes"],
            base64::engine::general_purpose::STANDARD.encode(&png)
        );
    }

    #[test]
    fn test_random_seed_in_range() {
        let request = VideoGenerationRequest::new("waves");
        for _ in 0..20 {
            let input = request.to_model_input().unwrap();
            let seed = input["videoGenerationConfig"]["seed"].as_u64().unwrap();
            assert!(seed <= u64::from(MAX_SEED));
        }
    }

    #[test]
    fn test_rejects_empty_prompt_and_large_seed() {
        assert!(matches!(
            VideoGenerationRequest::new("   ").to_model_input(),
            Err(ReelWatchError::InvalidRequest(_))
        ));
        assert!(matches!(
            VideoGenerationRequest::new("waves")
                .with_seed(u32::MAX)
                .to_model_input(),
            Err(ReelWatchError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_detect_image_format() {
        assert_eq!(
            ImageFormat::detect(&[0x89, b'P', b'N', b'G', 0x0D]),
            Some(ImageFormat::Png)
        );
        assert_eq!(
            ImageFormat::detect(&[0xFF, 0xD8, 0xFF, 0xE0]),
            Some(ImageFormat::Jpeg)
        );
        assert_eq!(ImageFormat::detect(b"GIF89a"), None);
    }

    #[test]
    fn test_with_image_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE0, 0x00]).unwrap();

        let request = VideoGenerationRequest::new("waves")
            .with_image_file(&path)
            .unwrap();
        assert_eq!(request.image.unwrap().1, ImageFormat::Jpeg);

        let bad = tmp.path().join("frame.gif");
        std::fs::write(&bad, b"GIF89a").unwrap();
        assert!(VideoGenerationRequest::new("waves").with_image_file(&bad).is_err());
    }
}
