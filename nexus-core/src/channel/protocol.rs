//! JSON message shapes of the BidiGenerateContent live endpoint.
//!
//! Only the fields the session uses are modelled; unknown fields are ignored
//! on the way in.

use serde::{Deserialize, Serialize};

use super::{ChannelEvent, SessionSetup};
use crate::codec::{EncodedFrame, InboundFrame};

// ── Client → server ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ClientSetup {
    pub setup: SetupBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupBody {
    /// Fully qualified, e.g. `models/gemini-2.5-flash-native-audio-preview-09-2025`.
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<&'static str>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl From<&SessionSetup> for ClientSetup {
    fn from(setup: &SessionSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };
        ClientSetup {
            setup: SetupBody {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO"],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: setup.voice_name.clone(),
                            },
                        },
                    },
                },
                system_instruction: setup
                    .system_instruction
                    .as_ref()
                    .filter(|text| !text.trim().is_empty())
                    .map(|text| Content {
                        parts: vec![TextPart { text: text.clone() }],
                    }),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage<'a> {
    pub realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
pub struct RealtimeInput<'a> {
    pub audio: &'a EncodedFrame,
}

impl<'a> RealtimeInputMessage<'a> {
    pub fn audio(frame: &'a EncodedFrame) -> Self {
        Self {
            realtime_input: RealtimeInput { audio: frame },
        }
    }
}

// ── Server → client ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

pub fn parse_server_message(text: &str) -> serde_json::Result<ServerMessage> {
    serde_json::from_str(text)
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Channel events carried by this message, in delivery order.
    pub fn into_events(self) -> Vec<ChannelEvent> {
        let Some(content) = self.server_content else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if content.interrupted {
            events.push(ChannelEvent::Interrupted);
        }
        for part in content.model_turn.into_iter().flat_map(|turn| turn.parts) {
            if let Some(inline) = part.inline_data {
                let is_audio = inline
                    .mime_type
                    .as_deref()
                    .map_or(true, |m| m.starts_with("audio/"));
                if is_audio {
                    events.push(ChannelEvent::Audio(InboundFrame::new(
                        inline.data,
                        inline.mime_type,
                    )));
                }
            }
            if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                events.push(ChannelEvent::Text(text));
            }
        }
        if content.turn_complete {
            events.push(ChannelEvent::TurnComplete);
        }
        events
    }
}
