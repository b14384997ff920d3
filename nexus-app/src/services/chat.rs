//! Streaming text chat with optional search grounding.
//!
//! Each user message is sent together with the conversation so far to
//! `:streamGenerateContent?alt=sse`. Deltas are yielded as they arrive; the
//! exchange is only added to history once the stream finishes cleanly.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use futures_util::{stream::BoxStream, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Content, GeminiClient, GenerateContentResponse};

pub const WELCOME_MESSAGE: &str =
    "Hello! I'm Gemini Nexus. How can I help you today? I can search the web for real-time info!";
pub const ERROR_MESSAGE: &str = "I encountered an error processing your request.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamRequest<'a> {
    contents: Vec<&'a Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

/// One conversation. History holds alternating `user` / `model` turns.
pub struct ChatSession {
    client: GeminiClient,
    model: String,
    system_instruction: String,
    search_grounding: bool,
    history: Vec<Content>,
}

impl ChatSession {
    pub fn new(
        client: GeminiClient,
        model: impl Into<String>,
        system_instruction: impl Into<String>,
        search_grounding: bool,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            system_instruction: system_instruction.into(),
            search_grounding,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    fn request_body<'a>(&'a self, message: &'a Content) -> StreamRequest<'a> {
        let mut contents: Vec<&Content> = self.history.iter().collect();
        contents.push(message);
        StreamRequest {
            contents,
            system_instruction: Some(Content::text(None, self.system_instruction.clone())),
            tools: if self.search_grounding {
                vec![json!({ "googleSearch": {} })]
            } else {
                Vec::new()
            },
        }
    }

    /// Send `text` and return a turn that yields the reply incrementally.
    pub async fn send(&mut self, text: &str) -> Result<ChatTurn<'_>> {
        let message = Content::text(Some("user"), text);
        let response = self
            .client
            .post(
                &self.model,
                "streamGenerateContent",
                "alt=sse",
                &self.request_body(&message),
            )
            .await?;
        debug!(model = %self.model, turns = self.history.len(), "chat stream opened");

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(ChatTurn {
            session: self,
            message,
            stream,
            parser: SseParser::default(),
            pending: VecDeque::new(),
            reply: String::new(),
            finished: false,
        })
    }
}

/// A reply being streamed. Dropping it early discards the exchange.
pub struct ChatTurn<'a> {
    session: &'a mut ChatSession,
    message: Content,
    stream: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    parser: SseParser,
    pending: VecDeque<String>,
    reply: String,
    finished: bool,
}

impl ChatTurn<'_> {
    /// Next piece of reply text, or `None` once the reply is complete.
    pub async fn next_delta(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Ok(Some(delta));
            }
            if self.finished {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.context("chat stream interrupted")?;
                    for payload in self.parser.push(&chunk) {
                        self.accept(&payload);
                    }
                }
                None => {
                    if let Some(payload) = self.parser.finish() {
                        self.accept(&payload);
                    }
                    self.commit();
                }
            }
        }
    }

    fn accept(&mut self, payload: &str) {
        match delta_text(payload) {
            Ok(Some(delta)) => {
                self.reply.push_str(&delta);
                self.pending.push_back(delta);
            }
            Ok(None) => {}
            Err(e) => warn!("skipping malformed chat chunk: {e}"),
        }
    }

    fn commit(&mut self) {
        self.finished = true;
        let message = std::mem::replace(&mut self.message, Content::text(Some("user"), ""));
        self.session.history.push(message);
        self.session
            .history
            .push(Content::text(Some("model"), self.reply.clone()));
    }
}

/// Splits a server-sent-events byte stream into `data:` payloads.
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a final line that arrived without a trailing newline.
    fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let payload = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim_start();
    (!payload.is_empty() && payload != "[DONE]").then(|| payload.to_string())
}

/// Concatenated text parts of one streamed response chunk.
fn delta_text(payload: &str) -> serde_json::Result<Option<String>> {
    let response: GenerateContentResponse = serde_json::from_str(payload)?;
    let text: String = response
        .first_parts()
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    Ok((!text.is_empty()).then_some(text))
}
