pub mod clock;
pub mod config;
pub mod display;
pub mod dst;
pub mod error;
pub mod http;
pub mod page;
pub mod server;
pub mod sntp;
pub mod state;

pub use clock::{
    ClockEngine, ClockInput, ClockPhase, DisplayAction, CONNECTING_MESSAGE,
    SYNC_ERROR_MESSAGE,
};
pub use config::{
    require_settings, AlarmTime, ClockConfig, LoadedSettings, Settings, SETTINGS_KEY,
};
pub use display::{apply_actions, CharDisplay, TextGrid};
pub use error::{FormError, SettingsError, StartupError, SyncError};
pub use http::{PendingRequest, Request};
pub use server::{handle_request, Outcome, Response};
pub use state::SharedState;
