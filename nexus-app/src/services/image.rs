//! Single-shot image generation.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{GeminiClient, GenerateContentResponse};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "3:4")]
    ThreeFour,
    #[serde(rename = "4:3")]
    FourThree,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        Self::Square,
        Self::Landscape,
        Self::Portrait,
        Self::ThreeFour,
        Self::FourThree,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Portrait => "9:16",
            Self::ThreeFour => "3:4",
            Self::FourThree => "4:3",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AspectRatio {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == wanted)
            .ok_or_else(|| {
                let choices: Vec<&str> = Self::ALL.iter().map(|r| r.as_str()).collect();
                anyhow!("unknown aspect ratio {wanted:?} (expected one of {})", choices.join(", "))
            })
    }
}

/// A generated image kept for the session gallery, newest first.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    /// `data:image/png;base64,...`
    pub url: String,
    /// Decoded copy on disk, if it could be written.
    pub path: Option<PathBuf>,
}

pub struct ImageService {
    client: GeminiClient,
    model: String,
    gallery: Vec<GeneratedImage>,
}

impl ImageService {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            gallery: Vec::new(),
        }
    }

    pub fn gallery(&self) -> &[GeneratedImage] {
        &self.gallery
    }

    /// Request one image. `Ok(None)` means the model answered without image data.
    pub async fn generate(&self, prompt: &str, aspect_ratio: AspectRatio) -> Result<Option<String>> {
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "imageConfig": { "aspectRatio": aspect_ratio.as_str() }
            }
        });
        let response = self
            .client
            .post(&self.model, "generateContent", "", &body)
            .await?;
        let parsed: GenerateContentResponse = response
            .json()
            .await
            .context("image response was not valid JSON")?;
        Ok(first_image_url(&parsed))
    }

    /// Generate, save a preview file, and prepend the result to the gallery.
    pub async fn generate_into_gallery(
        &mut self,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<Option<&GeneratedImage>> {
        let Some(url) = self.generate(prompt, aspect_ratio).await? else {
            return Ok(None);
        };
        let path = match save_preview(&url, std::env::temp_dir()) {
            Ok(path) => {
                info!(path = %path.display(), "image saved");
                Some(path)
            }
            Err(e) => {
                warn!("could not save image preview: {e:#}");
                None
            }
        };
        self.gallery.insert(
            0,
            GeneratedImage {
                prompt: prompt.to_string(),
                aspect_ratio,
                url,
                path,
            },
        );
        Ok(self.gallery.first())
    }
}

fn first_image_url(response: &GenerateContentResponse) -> Option<String> {
    response
        .first_parts()
        .iter()
        .find_map(|p| p.inline_data.as_ref())
        .map(|inline| format!("data:image/png;base64,{}", inline.data))
}

/// Decode a `data:` URL and write it as `nexus-<timestamp>.png` under `dir`.
pub fn save_preview(data_url: &str, dir: PathBuf) -> Result<PathBuf> {
    let (_, encoded) = data_url
        .split_once(";base64,")
        .ok_or_else(|| anyhow!("not a base64 data URL"))?;
    let bytes = STANDARD.decode(encoded).context("image data is not valid base64")?;
    let name = format!("nexus-{}.png", chrono::Local::now().format("%Y%m%d-%H%M%S%.3f"));
    let path = dir.join(name);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_parses_known_values_only() {
        assert_eq!(" 16:9 ".parse::<AspectRatio>().unwrap(), AspectRatio::Landscape);
        assert_eq!("3:4".parse::<AspectRatio>().unwrap(), AspectRatio::ThreeFour);
        let err = "2:1".parse::<AspectRatio>().unwrap_err();
        assert!(err.to_string().contains("1:1, 16:9, 9:16, 3:4, 4:3"));
        assert_eq!(
            serde_json::to_string(&AspectRatio::Portrait).unwrap(),
            "\"9:16\""
        );
    }

    #[test]
    fn first_inline_data_becomes_png_data_url() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here is your image"},
                    {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo="}},
                    {"inlineData": {"mimeType": "image/png", "data": "second"}}
                ]}
            }]
        }))
        .unwrap();
        assert_eq!(
            first_image_url(&response).as_deref(),
            Some("data:image/png;base64,iVBORw0KGgo=")
        );
    }

    #[test]
    fn text_only_answer_yields_no_image() {
        let response: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{"content": {"parts": [{"text": "I can't draw that."}]}}]
        }))
        .unwrap();
        assert_eq!(first_image_url(&response), None);
        assert_eq!(first_image_url(&GenerateContentResponse::default()), None);
    }

    #[test]
    fn preview_is_decoded_to_disk() {
        let dir = std::env::temp_dir().join(format!("nexus-image-{}", std::process::id()));
        let url = format!("data:image/png;base64,{}", STANDARD.encode(b"\x89PNG"));
        let path = save_preview(&url, dir.clone()).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"\x89PNG");
        assert!(save_preview("https://example.com/x.png", dir.clone()).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
