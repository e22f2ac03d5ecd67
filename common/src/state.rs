//! Process-wide status shared between the display task and the settings server.
//!
//! Every field is its own lock-free cell and is replaced as a whole record,
//! so a reader sees either the old or the new value, never a mix. Each field
//! has a single writer: the server owns `settings`, startup owns `ip` and the
//! startup overlay, the display runner owns the time-sync overlay.

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::config::Settings;

pub struct SharedState {
    settings: ArcSwap<Settings>,
    ip: ArcSwapOption<String>,
    overlay: ArcSwapOption<String>,
}

impl SharedState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
            ip: ArcSwapOption::empty(),
            overlay: ArcSwapOption::empty(),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn replace_settings(&self, settings: Settings) {
        self.settings.store(Arc::new(settings));
    }

    pub fn ip(&self) -> Option<Arc<String>> {
        self.ip.load_full()
    }

    pub fn set_ip(&self, ip: impl Into<String>) {
        self.ip.store(Some(Arc::new(ip.into())));
    }

    /// Non-empty overlay replaces the clock on the display.
    pub fn overlay(&self) -> Option<Arc<String>> {
        self.overlay.load_full()
    }

    pub fn set_overlay(&self, message: impl Into<String>) {
        self.overlay.store(Some(Arc::new(message.into())));
    }

    pub fn clear_overlay(&self) {
        self.overlay.store(None);
    }

    /// Clears the overlay only if it still shows `expected`.
    pub fn clear_overlay_if(&self, expected: &str) {
        self.overlay.rcu(|current| match current {
            Some(message) if message.as_str() == expected => None,
            other => other.clone(),
        });
    }
}
