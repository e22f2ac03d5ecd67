use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings are not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("settings field `{0}` is missing")]
    Missing(&'static str),
}

/// Failures that stop the device before the configuration server starts.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("no usable settings: {0}")]
    ConfigurationMissing(String),
    #[error("wifi association with `{ssid}` failed")]
    NetworkAssociationFailure { ssid: String },
}

impl StartupError {
    /// Text shown on the display before the device halts.
    pub fn overlay(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing(_) => "No WiFi settings!\nFlash manually.",
            Self::NetworkAssociationFailure { .. } => "WiFi Conn. failed!\nFlash manually.",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("time server `{server}` unreachable: {reason}")]
    Unreachable { server: String, reason: String },
    #[error("time server did not answer within {0} ms")]
    Timeout(u64),
    #[error("invalid time server response: {0}")]
    InvalidResponse(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormError {
    #[error("field `{field}` is not a valid offset: `{value}`")]
    InvalidNumber { field: &'static str, value: String },
    #[error("alarm `{0}` is not a valid HH:MM time")]
    InvalidAlarm(String),
    #[error("field `{field}` is longer than {max} bytes")]
    TooLong { field: &'static str, max: usize },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn startup_failures_have_fixed_overlays() {
        let missing = StartupError::ConfigurationMissing("settings.json not found".to_string());
        let offline = StartupError::NetworkAssociationFailure {
            ssid: "Home".to_string(),
        };

        assert_eq!(missing.overlay(), "No WiFi settings!\nFlash manually.");
        assert_eq!(offline.overlay(), "WiFi Conn. failed!\nFlash manually.");
        assert_eq!(offline.to_string(), "wifi association with `Home` failed");
    }
}
