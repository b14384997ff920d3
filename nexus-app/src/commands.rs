//! Console command parsing and handlers.
//!
//! Lines starting with `/` are commands; anything else is the active view's
//! input (a chat message or an image prompt). In the Live view the bare words
//! `connect`, `disconnect`, `mute`, `status` and `reset` work as well.

use std::io::Write;

use anyhow::Result;
use nexus_core::{list_input_devices, list_output_devices, DeviceInfo, LiveError, SessionState};
use tracing::{error, info, warn};

use crate::services::{
    chat::{ERROR_MESSAGE, WELCOME_MESSAGE},
    image::{AspectRatio, GeneratedImage},
};
use crate::state::{AppState, View};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Switch(View),
    Devices,
    Help,
    Quit,
    Connect,
    Disconnect,
    ToggleMute,
    Status,
    Reset,
    SetRatio(AspectRatio),
    Gallery,
    ClearChat,
    /// Chat message or image prompt, depending on the view.
    Input(String),
    Empty,
    /// Unusable input, with a hint for the user.
    Invalid(String),
}

/// Whether the console loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub fn parse(line: &str, view: View) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    let (word, rest) = match line.strip_prefix('/') {
        Some(cmd) => {
            let (word, rest) = cmd.split_once(char::is_whitespace).unwrap_or((cmd, ""));
            (word.to_ascii_lowercase(), rest.trim())
        }
        None if view == View::Live => (line.to_ascii_lowercase(), ""),
        None => return Command::Input(line.to_string()),
    };

    match (word.as_str(), view) {
        ("chat", _) => Command::Switch(View::Chat),
        ("live", _) => Command::Switch(View::Live),
        ("image" | "media", _) => Command::Switch(View::Image),
        ("devices", _) => Command::Devices,
        ("help" | "?", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        ("connect" | "start", View::Live) => Command::Connect,
        ("disconnect" | "stop", View::Live) => Command::Disconnect,
        ("mute" | "unmute", View::Live) => Command::ToggleMute,
        ("status", View::Live) => Command::Status,
        ("reset", View::Live) => Command::Reset,
        ("ratio", View::Image) if rest.is_empty() => {
            Command::Invalid("usage: /ratio <1:1|16:9|9:16|3:4|4:3>".into())
        }
        ("ratio", View::Image) => match rest.parse() {
            Ok(ratio) => Command::SetRatio(ratio),
            Err(e) => Command::Invalid(e.to_string()),
        },
        ("gallery", View::Image) => Command::Gallery,
        ("clear", View::Chat) => Command::ClearChat,
        (_, View::Live) if !line.starts_with('/') => Command::Invalid(
            "the Live view takes connect, disconnect, mute, status or reset".into(),
        ),
        (other, _) => Command::Invalid(format!("unknown command /{other} in {view} (try /help)")),
    }
}

/// Run one command against the app state, writing user-facing output to `out`.
pub async fn execute(state: &mut AppState, command: Command, out: &mut impl Write) -> Result<Flow> {
    match command {
        Command::Empty => {}
        Command::Invalid(hint) => writeln!(out, "{hint}")?,
        Command::Help => write_help(out, state.view)?,
        Command::Quit => {
            state.shutdown().await;
            return Ok(Flow::Quit);
        }
        Command::Switch(view) => {
            state.switch_view(view).await;
            writeln!(out, "── {view} ──")?;
            if view == View::Chat && state.chat.history().is_empty() {
                writeln!(out, "{}", WELCOME_MESSAGE)?;
            }
        }
        Command::Devices => {
            write_devices(out, "Input", &list_input_devices())?;
            write_devices(out, "Output", &list_output_devices())?;
        }
        Command::Connect => {
            // Runs in the background so `disconnect` can cancel a slow handshake.
            let engine = state.engine.clone();
            tokio::spawn(async move {
                let mut stdout = std::io::stdout();
                if let Err(e) = report_connect(engine.connect().await, &mut stdout) {
                    warn!("console write failed: {e}");
                }
            });
            writeln!(out, "Connecting... type `disconnect` to cancel.")?;
        }
        Command::Disconnect => {
            state.engine.disconnect().await?;
            writeln!(out, "Disconnected.")?;
        }
        Command::ToggleMute => match state.engine.toggle_mute().await {
            Ok(true) => writeln!(out, "Microphone muted.")?,
            Ok(false) => writeln!(out, "Microphone live.")?,
            Err(e) => writeln!(out, "{e}")?,
        },
        Command::Status => write_status(out, state)?,
        Command::Reset => {
            state.engine.reset().await?;
            writeln!(out, "Live session reset.")?;
        }
        Command::SetRatio(ratio) => {
            state.set_aspect_ratio(ratio);
            writeln!(out, "Aspect ratio: {ratio}")?;
        }
        Command::Gallery => write_gallery(out, state.images.gallery())?,
        Command::ClearChat => {
            state.chat.clear();
            writeln!(out, "{}", WELCOME_MESSAGE)?;
        }
        Command::Input(text) => match state.view {
            View::Chat => send_chat(state, &text, out).await?,
            View::Image => generate_image(state, &text, out).await?,
            View::Live => {}
        },
    }
    Ok(Flow::Continue)
}

fn report_connect(result: nexus_core::Result<()>, out: &mut impl Write) -> std::io::Result<()> {
    match result {
        Ok(()) => writeln!(out, "\nConnected. Start talking; type `mute` to pause the mic."),
        Err(LiveError::Cancelled) => writeln!(out, "\nConnect cancelled."),
        Err(e) => {
            error!("live connect failed: {e}");
            writeln!(out, "\nCould not start the live session: {e}")
        }
    }
}

async fn send_chat(state: &mut AppState, text: &str, out: &mut impl Write) -> Result<()> {
    let mut turn = match state.chat.send(text).await {
        Ok(turn) => turn,
        Err(e) => {
            error!("chat request failed: {e:#}");
            writeln!(out, "{ERROR_MESSAGE}")?;
            return Ok(());
        }
    };
    loop {
        match turn.next_delta().await {
            Ok(Some(delta)) => {
                write!(out, "{delta}")?;
                out.flush()?;
            }
            Ok(None) => break,
            Err(e) => {
                error!("chat stream failed: {e:#}");
                writeln!(out)?;
                writeln!(out, "{ERROR_MESSAGE}")?;
                return Ok(());
            }
        }
    }
    writeln!(out)?;
    Ok(())
}

async fn generate_image(state: &mut AppState, prompt: &str, out: &mut impl Write) -> Result<()> {
    let ratio = state.aspect_ratio;
    writeln!(out, "Generating ({ratio})...")?;
    match state.images.generate_into_gallery(prompt, ratio).await {
        Ok(Some(image)) => match &image.path {
            Some(path) => writeln!(out, "Saved to {}", path.display())?,
            None => writeln!(out, "Image received ({} bytes of data URL)", image.url.len())?,
        },
        Ok(None) => writeln!(out, "The model returned no image. Try a different prompt.")?,
        Err(e) => {
            warn!("image generation failed: {e:#}");
            writeln!(out, "Failed to generate image. Try a different prompt.")?;
        }
    }
    info!(gallery = state.images.gallery().len(), "image request finished");
    Ok(())
}

fn write_status(out: &mut impl Write, state: &AppState) -> std::io::Result<()> {
    let engine = &state.engine;
    let status = engine.status();
    writeln!(out, "status: {status}")?;
    if status == SessionState::Connected {
        let muted = if engine.is_muted() { " (muted)" } else { "" };
        writeln!(out, "mic:    {}{muted}", volume_bar(engine.volume()))?;
    }
    let d = engine.diagnostics_snapshot();
    writeln!(
        out,
        "blocks: {} captured, {} muted | frames: {} sent, {} dropped | inbound: {} ({} bad)",
        d.blocks_captured,
        d.blocks_muted,
        d.frames_sent,
        d.frames_dropped,
        d.inbound_frames,
        d.decode_errors
    )
}

/// Twenty-cell meter for a level in [0, 100].
fn volume_bar(level: f32) -> String {
    let level = if level.is_finite() { level.clamp(0.0, 100.0) } else { 0.0 };
    let filled = (level / 5.0).round() as usize;
    format!("[{}{}] {level:>3.0}", "#".repeat(filled), "-".repeat(20 - filled))
}

fn write_devices(out: &mut impl Write, label: &str, devices: &[DeviceInfo]) -> std::io::Result<()> {
    writeln!(out, "{label} devices:")?;
    if devices.is_empty() {
        writeln!(out, "  (none found)")?;
    }
    for device in devices {
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_loopback_like {
            tags.push("loopback?");
        }
        if tags.is_empty() {
            writeln!(out, "  {}", device.name)?;
        } else {
            writeln!(out, "  {} [{}]", device.name, tags.join(", "))?;
        }
    }
    Ok(())
}

fn write_gallery(out: &mut impl Write, images: &[GeneratedImage]) -> std::io::Result<()> {
    if images.is_empty() {
        return writeln!(out, "No images yet. Describe one to get started.");
    }
    for (i, image) in images.iter().enumerate() {
        let location = image
            .path
            .as_ref()
            .map_or_else(|| "(not saved)".to_string(), |p| p.display().to_string());
        writeln!(out, "{:>2}. [{}] {}", i + 1, image.aspect_ratio, image.prompt)?;
        writeln!(out, "    {location}")?;
    }
    Ok(())
}

fn write_help(out: &mut impl Write, view: View) -> std::io::Result<()> {
    writeln!(out, "/chat /live /image   switch view")?;
    writeln!(out, "/devices             list audio devices")?;
    writeln!(out, "/quit                exit")?;
    match view {
        View::Chat => {
            writeln!(out, "/clear               start a new conversation")?;
            writeln!(out, "<text>               send a message")
        }
        View::Live => writeln!(out, "connect | disconnect | mute | status | reset"),
        View::Image => {
            writeln!(out, "/ratio <r>           1:1, 16:9, 9:16, 3:4 or 4:3")?;
            writeln!(out, "/gallery             images generated this session")?;
            writeln!(out, "<text>               generate an image")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::future::{self, BoxFuture};
    use nexus_core::audio::{
        DeviceGuard, InputRequest, InputStreamHandle, OutputClock, OutputRequest,
        OutputStreamHandle,
    };
    use nexus_core::buffering::{AudioConsumer, AudioProducer};
    use nexus_core::channel::{ChannelHandle, SessionSetup};
    use nexus_core::{AudioBackend, ChannelConnector, EngineConfig, LiveEngine};

    use crate::services::{chat::ChatSession, image::ImageService, GeminiClient};
    use crate::settings::AppSettings;

    struct Released;

    impl DeviceGuard for Released {
        fn close(&mut self) {}
    }

    /// Devices that open instantly and never produce sound.
    struct QuietDevices;

    impl AudioBackend for QuietDevices {
        fn open_input(
            &self,
            request: &InputRequest,
            _producer: AudioProducer,
        ) -> nexus_core::Result<InputStreamHandle> {
            Ok(InputStreamHandle::new(request.sample_rate, Box::new(Released)))
        }

        fn open_output(
            &self,
            request: &OutputRequest,
            _consumer: AudioConsumer,
        ) -> nexus_core::Result<OutputStreamHandle> {
            Ok(OutputStreamHandle::new(
                request.sample_rate,
                OutputClock::new(request.sample_rate),
                Box::new(Released),
            ))
        }
    }

    /// A remote that never answers the handshake.
    struct SilentRemote;

    impl ChannelConnector for SilentRemote {
        fn connect(&self, _setup: SessionSetup) -> BoxFuture<'static, nexus_core::Result<ChannelHandle>> {
            Box::pin(future::pending())
        }
    }

    fn live_state() -> AppState {
        let client = GeminiClient::new(None).unwrap();
        AppState {
            engine: LiveEngine::spawn(
                EngineConfig::default(),
                Arc::new(QuietDevices),
                Arc::new(SilentRemote),
            ),
            settings: AppSettings::default(),
            settings_path: std::env::temp_dir()
                .join(format!("nexus-commands-{}", std::process::id()))
                .join("settings.json"),
            chat: ChatSession::new(client.clone(), "chat-model", "Be brief.", false),
            images: ImageService::new(client, "image-model"),
            aspect_ratio: AspectRatio::Square,
            view: View::Live,
        }
    }

    async fn wait_for(engine: &LiveEngine, want: SessionState) {
        for _ in 0..200 {
            if engine.status() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("engine never reached {want}, still {}", engine.status());
    }

    #[tokio::test]
    async fn connect_returns_to_the_prompt_and_disconnect_cancels_it() {
        let mut state = live_state();
        let mut out = Vec::new();

        let flow = tokio::time::timeout(
            Duration::from_secs(1),
            execute(&mut state, Command::Connect, &mut out),
        )
        .await
        .expect("connect must not hold the console")
        .unwrap();
        assert_eq!(flow, Flow::Continue);
        wait_for(&state.engine, SessionState::Connecting).await;

        execute(&mut state, Command::Disconnect, &mut out).await.unwrap();
        assert_eq!(state.engine.status(), SessionState::Idle);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Connecting..."));
        assert!(text.ends_with("Disconnected.\n"));
    }

    #[test]
    fn connect_outcomes_are_reported() {
        let mut out = Vec::new();
        report_connect(Ok(()), &mut out).unwrap();
        report_connect(Err(LiveError::Cancelled), &mut out).unwrap();
        report_connect(Err(LiveError::ChannelOpen("refused".into())), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Connected. Start talking"));
        assert!(text.contains("Connect cancelled."));
        assert!(text.contains("Could not start the live session"));
        assert!(text.contains("refused"));
    }

    #[test]
    fn navigation_works_from_every_view() {
        for view in [View::Chat, View::Live, View::Image] {
            assert_eq!(parse("/live", view), Command::Switch(View::Live));
            assert_eq!(parse(" /IMAGE ", view), Command::Switch(View::Image));
            assert_eq!(parse("/quit", view), Command::Quit);
            assert_eq!(parse("", view), Command::Empty);
        }
    }

    #[test]
    fn plain_text_is_input_outside_live() {
        assert_eq!(
            parse("what's the weather in Oslo?", View::Chat),
            Command::Input("what's the weather in Oslo?".into())
        );
        assert_eq!(
            parse("a lighthouse at dusk", View::Image),
            Command::Input("a lighthouse at dusk".into())
        );
    }

    #[test]
    fn live_accepts_bare_words_and_slash_forms() {
        assert_eq!(parse("connect", View::Live), Command::Connect);
        assert_eq!(parse("/disconnect", View::Live), Command::Disconnect);
        assert_eq!(parse("Mute", View::Live), Command::ToggleMute);
        assert_eq!(parse("status", View::Live), Command::Status);
        assert!(matches!(parse("hello there", View::Live), Command::Invalid(_)));
        assert!(matches!(parse("/connect", View::Chat), Command::Invalid(_)));
    }

    #[test]
    fn ratio_is_validated() {
        assert_eq!(
            parse("/ratio 9:16", View::Image),
            Command::SetRatio(AspectRatio::Portrait)
        );
        assert!(matches!(parse("/ratio", View::Image), Command::Invalid(_)));
        assert!(matches!(parse("/ratio 2:1", View::Image), Command::Invalid(_)));
    }

    #[test]
    fn gallery_lists_newest_first_with_location() {
        let images = vec![
            GeneratedImage {
                prompt: "neon city".into(),
                aspect_ratio: AspectRatio::Landscape,
                url: "data:image/png;base64,AA==".into(),
                path: Some(std::path::PathBuf::from("/tmp/nexus-1.png")),
            },
            GeneratedImage {
                prompt: "a cat".into(),
                aspect_ratio: AspectRatio::Square,
                url: "data:image/png;base64,AA==".into(),
                path: None,
            },
        ];
        let mut out = Vec::new();
        write_gallery(&mut out, &images).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(" 1. [16:9] neon city\n    /tmp/nexus-1.png\n"));
        assert!(text.contains(" 2. [1:1] a cat\n    (not saved)"));
        assert_eq!(parse("/gallery", View::Image), Command::Gallery);
    }

    #[test]
    fn volume_bar_scales_and_clamps() {
        assert_eq!(volume_bar(0.0), format!("[{}]   0", "-".repeat(20)));
        assert_eq!(volume_bar(50.0), format!("[{}{}]  50", "#".repeat(10), "-".repeat(10)));
        assert_eq!(volume_bar(250.0), format!("[{}] 100", "#".repeat(20)));
        assert_eq!(volume_bar(f32::NAN), volume_bar(0.0));
    }

    #[test]
    fn device_listing_marks_default_and_loopback() {
        let devices = vec![
            DeviceInfo {
                name: "Built-in Mic".into(),
                is_default: true,
                is_loopback_like: false,
            },
            DeviceInfo {
                name: "Stereo Mix".into(),
                is_default: false,
                is_loopback_like: true,
            },
        ];
        let mut out = Vec::new();
        write_devices(&mut out, "Input", &devices).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Built-in Mic [default]"));
        assert!(text.contains("Stereo Mix [loopback?]"));
    }
}
