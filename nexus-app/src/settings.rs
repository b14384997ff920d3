//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nexus_core::{EngineConfig, GeminiLiveConnector};
use serde::{Deserialize, Serialize};

use crate::services::image::AspectRatio;

pub const MODEL_CHAT: &str = "gemini-2.5-flash";
pub const MODEL_IMAGE: &str = "gemini-2.5-flash-image";
pub const MODEL_LIVE: &str = nexus_core::engine::DEFAULT_LIVE_MODEL;
pub const DEFAULT_VOICE: &str = nexus_core::engine::DEFAULT_VOICE;

pub const SYSTEM_INSTRUCTION: &str = "You are Gemini Nexus, a helpful, witty, and advanced AI assistant demonstrating the capabilities of the Gemini API. Be concise but informative.";

const VOICES: &[&str] = &["Puck", "Charon", "Kore", "Fenrir", "Aoede"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub chat_model: String,
    pub image_model: String,
    pub live_model: String,
    pub voice_name: String,
    pub system_instruction: String,
    /// Send live sessions the system instruction too (chat always does).
    pub live_system_instruction: bool,
    pub search_grounding: bool,
    pub default_aspect_ratio: AspectRatio,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub max_playback_backlog_secs: u64,
    /// Live WebSocket URL; `None` uses the public endpoint.
    pub live_endpoint: Option<String>,
    /// How long to wait for the live server to accept the session setup.
    pub live_setup_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            chat_model: MODEL_CHAT.into(),
            image_model: MODEL_IMAGE.into(),
            live_model: MODEL_LIVE.into(),
            voice_name: DEFAULT_VOICE.into(),
            system_instruction: SYSTEM_INSTRUCTION.into(),
            live_system_instruction: false,
            search_grounding: true,
            default_aspect_ratio: AspectRatio::Square,
            preferred_input_device: None,
            preferred_output_device: None,
            max_playback_backlog_secs: 60,
            live_endpoint: None,
            live_setup_timeout_secs: 15,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.chat_model = normalize_model(&self.chat_model, MODEL_CHAT);
        self.image_model = normalize_model(&self.image_model, MODEL_IMAGE);
        self.live_model = normalize_model(&self.live_model, MODEL_LIVE);
        self.voice_name = normalize_voice(&self.voice_name);
        let instruction = self.system_instruction.trim();
        self.system_instruction = if instruction.is_empty() {
            SYSTEM_INSTRUCTION.into()
        } else {
            instruction.into()
        };
        self.preferred_input_device = normalize_device(self.preferred_input_device.as_deref());
        self.preferred_output_device = normalize_device(self.preferred_output_device.as_deref());
        self.max_playback_backlog_secs = self.max_playback_backlog_secs.clamp(5, 600);
        self.live_endpoint = self
            .live_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        self.live_setup_timeout_secs = self.live_setup_timeout_secs.clamp(1, 120);
    }

    /// Apply `NEXUS_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("NEXUS_CHAT_MODEL") {
            self.chat_model = v;
        }
        if let Some(v) = lookup("NEXUS_IMAGE_MODEL") {
            self.image_model = v;
        }
        if let Some(v) = lookup("NEXUS_LIVE_MODEL") {
            self.live_model = v;
        }
        if let Some(v) = lookup("NEXUS_VOICE") {
            self.voice_name = v;
        }
        if let Some(v) = lookup("NEXUS_INPUT_DEVICE") {
            self.preferred_input_device = Some(v);
        }
        if let Some(v) = lookup("NEXUS_OUTPUT_DEVICE") {
            self.preferred_output_device = Some(v);
        }
        if let Some(v) = lookup("NEXUS_SEARCH_GROUNDING") {
            self.search_grounding = parse_flag(&v).unwrap_or(self.search_grounding);
        }
        if let Some(v) = lookup("NEXUS_MAX_PLAYBACK_BACKLOG_SECS") {
            if let Ok(secs) = v.trim().parse() {
                self.max_playback_backlog_secs = secs;
            }
        }
        if let Some(v) = lookup("NEXUS_LIVE_ENDPOINT") {
            self.live_endpoint = Some(v);
        }
        if let Some(v) = lookup("NEXUS_LIVE_SETUP_TIMEOUT_SECS") {
            if let Ok(secs) = v.trim().parse() {
                self.live_setup_timeout_secs = secs;
            }
        }
        self.normalize();
    }

    /// Engine configuration for live sessions.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            model: self.live_model.clone(),
            voice_name: self.voice_name.clone(),
            system_instruction: self
                .live_system_instruction
                .then(|| self.system_instruction.clone()),
            preferred_input_device: self.preferred_input_device.clone(),
            preferred_output_device: self.preferred_output_device.clone(),
            max_playback_backlog: Duration::from_secs(self.max_playback_backlog_secs),
            ..EngineConfig::default()
        }
    }

    /// Live session connector with this configuration's endpoint and setup timeout.
    pub fn live_connector(&self, api_key: Option<String>) -> GeminiLiveConnector {
        let connector = GeminiLiveConnector::new(api_key)
            .with_setup_timeout(Duration::from_secs(self.live_setup_timeout_secs));
        match &self.live_endpoint {
            Some(url) => connector.with_endpoint(url.clone()),
            None => connector,
        }
    }
}

fn normalize_model(raw: &str, fallback: &str) -> String {
    let model = raw.trim().trim_start_matches("models/");
    if model.is_empty() {
        fallback.into()
    } else {
        model.into()
    }
}

fn normalize_voice(raw: &str) -> String {
    let wanted = raw.trim();
    VOICES
        .iter()
        .find(|v| v.eq_ignore_ascii_case(wanted))
        .map_or_else(|| DEFAULT_VOICE.into(), |v| (*v).into())
}

fn normalize_device(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("default"))
        .map(str::to_string)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// API credential from `API_KEY`, falling back to `GEMINI_API_KEY`.
pub fn api_key_from_env() -> Option<String> {
    ["API_KEY", "GEMINI_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|k| k.trim().to_string())
        .find(|k| !k.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Nexus")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("nexus")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_repairs_blank_and_unknown_values() {
        let mut settings = AppSettings {
            chat_model: "  ".into(),
            live_model: "models/custom-live".into(),
            voice_name: "kore".into(),
            system_instruction: "".into(),
            preferred_input_device: Some(" default ".into()),
            preferred_output_device: Some(" Speakers ".into()),
            max_playback_backlog_secs: 0,
            ..AppSettings::default()
        };
        settings.normalize();

        assert_eq!(settings.chat_model, MODEL_CHAT);
        assert_eq!(settings.live_model, "custom-live");
        assert_eq!(settings.voice_name, "Kore");
        assert_eq!(settings.system_instruction, SYSTEM_INSTRUCTION);
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.preferred_output_device.as_deref(), Some("Speakers"));
        assert_eq!(settings.max_playback_backlog_secs, 5);

        let mut settings = AppSettings {
            voice_name: "Robot".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.voice_name, DEFAULT_VOICE);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let parsed: AppSettings =
            serde_json::from_str(r#"{"voiceName":"Puck","defaultAspectRatio":"16:9"}"#).unwrap();
        assert_eq!(parsed.voice_name, "Puck");
        assert_eq!(parsed.default_aspect_ratio, AspectRatio::Landscape);
        assert_eq!(parsed.chat_model, MODEL_CHAT);
        assert!(parsed.search_grounding);
    }

    #[test]
    fn env_overrides_win_and_are_normalized() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| match key {
            "NEXUS_VOICE" => Some("fenrir".into()),
            "NEXUS_SEARCH_GROUNDING" => Some("off".into()),
            "NEXUS_MAX_PLAYBACK_BACKLOG_SECS" => Some("9999".into()),
            _ => None,
        });
        assert_eq!(settings.voice_name, "Fenrir");
        assert!(!settings.search_grounding);
        assert_eq!(settings.max_playback_backlog_secs, 600);
    }

    #[test]
    fn live_connection_settings_are_normalized() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| match key {
            "NEXUS_LIVE_ENDPOINT" => Some("  ".into()),
            "NEXUS_LIVE_SETUP_TIMEOUT_SECS" => Some("0".into()),
            _ => None,
        });
        assert_eq!(settings.live_endpoint, None);
        assert_eq!(settings.live_setup_timeout_secs, 1);

        settings.apply_overrides(|key| match key {
            "NEXUS_LIVE_ENDPOINT" => Some(" ws://127.0.0.1:9000/live ".into()),
            "NEXUS_LIVE_SETUP_TIMEOUT_SECS" => Some("30".into()),
            _ => None,
        });
        assert_eq!(settings.live_endpoint.as_deref(), Some("ws://127.0.0.1:9000/live"));
        assert_eq!(settings.live_setup_timeout_secs, 30);
    }

    #[tokio::test]
    async fn live_connector_uses_configured_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = AppSettings {
            live_endpoint: Some(format!("ws://{}", listener.local_addr().unwrap())),
            live_setup_timeout_secs: 1,
            ..AppSettings::default()
        };
        let connector = settings.live_connector(Some("k".into()));
        let attempt = tokio::spawn(async move {
            nexus_core::ChannelConnector::connect(
                &connector,
                nexus_core::channel::SessionSetup {
                    model: MODEL_LIVE.into(),
                    voice_name: DEFAULT_VOICE.into(),
                    system_instruction: None,
                },
            )
            .await
        });

        // The dial lands on our listener; accepting and never upgrading lets
        // the handshake fail or time out.
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
        assert!(attempt.await.unwrap().is_err());
    }

    #[test]
    fn engine_config_carries_live_settings() {
        let settings = AppSettings {
            preferred_input_device: Some("USB Mic".into()),
            live_system_instruction: true,
            ..AppSettings::default()
        };
        let config = settings.engine_config();
        assert_eq!(config.model, MODEL_LIVE);
        assert_eq!(config.voice_name, "Kore");
        assert_eq!(config.system_instruction.as_deref(), Some(SYSTEM_INSTRUCTION));
        assert_eq!(config.preferred_input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.max_playback_backlog, Duration::from_secs(60));
        assert_eq!(config.capture_sample_rate, 16_000);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("nexus-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            voice_name: "Aoede".into(),
            search_grounding: false,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(dir);
    }
}
