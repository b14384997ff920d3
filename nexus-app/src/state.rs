//! Console application state.

use std::fmt;
use std::path::PathBuf;

use nexus_core::LiveEngine;
use tracing::{info, warn};

use crate::services::{chat::ChatSession, image::AspectRatio, image::ImageService};
use crate::settings::{save_settings, AppSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Chat,
    Live,
    Image,
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            View::Chat => "Chat",
            View::Live => "Live",
            View::Image => "Image",
        })
    }
}

impl View {
    pub fn prompt(self) -> &'static str {
        match self {
            View::Chat => "chat> ",
            View::Live => "live> ",
            View::Image => "image> ",
        }
    }
}

/// Everything the console loop works on. Owned by the loop; only the engine
/// is shared with background tasks.
pub struct AppState {
    pub engine: LiveEngine,
    pub settings: AppSettings,
    pub settings_path: PathBuf,
    pub chat: ChatSession,
    pub images: ImageService,
    pub aspect_ratio: AspectRatio,
    pub view: View,
}

impl AppState {
    /// Change view. Leaving Live ends any live session.
    pub async fn switch_view(&mut self, view: View) {
        if self.view == View::Live && view != View::Live {
            self.end_live_session().await;
        }
        info!(from = %self.view, to = %view, "view changed");
        self.view = view;
    }

    /// Remember the ratio for this run and as the saved default.
    pub fn set_aspect_ratio(&mut self, ratio: AspectRatio) {
        self.aspect_ratio = ratio;
        if self.settings.default_aspect_ratio != ratio {
            self.settings.default_aspect_ratio = ratio;
            if let Err(e) = save_settings(&self.settings_path, &self.settings) {
                warn!(path = %self.settings_path.display(), "failed to save settings: {e}");
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.end_live_session().await;
    }

    async fn end_live_session(&self) {
        if let Err(e) = self.engine.disconnect().await {
            warn!("live disconnect failed: {e}");
        }
    }
}
