use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FormError, SettingsError, StartupError};

pub const SETTINGS_KEY: &str = "settings.json";

pub const DEFAULT_SUMMER_OFFSET_HOURS: u8 = 2;
pub const DEFAULT_WINTER_OFFSET_HOURS: u8 = 1;
pub const MAX_OFFSET_HOURS: u8 = 14;

// 802.11 station credential limits.
pub const MAX_SSID_BYTES: usize = 32;
pub const MAX_PASSWORD_BYTES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    pub tick_ms: u64,
    pub backlight_timeout_secs: u64,
    pub http_port: u16,
    pub initial_read_bytes: usize,
    pub body_read_chunk_bytes: usize,
    pub socket_error_delay_ms: u64,
    pub wifi_connect_attempts: u32,
    pub wifi_poll_interval_ms: u64,
    pub ntp_server: String,
    pub ntp_timeout_ms: u64,
    pub ntp_retry_secs: u64,
    pub display_rows: u8,
    pub display_cols: u8,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1_000,
            backlight_timeout_secs: 999,
            http_port: 80,
            initial_read_bytes: 2_048,
            body_read_chunk_bytes: 1_024,
            socket_error_delay_ms: 1_000,
            wifi_connect_attempts: 10,
            wifi_poll_interval_ms: 1_000,
            ntp_server: "pool.ntp.org".to_string(),
            ntp_timeout_ms: 5_000,
            ntp_retry_secs: 60,
            display_rows: 4,
            display_cols: 20,
        }
    }
}

/// Wall-clock time of day at which the backlight alarm fires.
///
/// Stored on disk as a two element `[hour, minute]` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(u8, u8)", into = "(u8, u8)")]
pub struct AlarmTime {
    hour: u8,
    minute: u8,
}

impl AlarmTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    /// Parses the `HH:MM` notation used by the settings form.
    pub fn parse(value: &str) -> Result<Self, FormError> {
        let invalid = || FormError::InvalidAlarm(value.to_string());
        let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
        let hour = hour.trim().parse::<u8>().map_err(|_| invalid())?;
        let minute = minute.trim().parse::<u8>().map_err(|_| invalid())?;
        Self::new(hour, minute).ok_or_else(invalid)
    }
}

impl Default for AlarmTime {
    fn default() -> Self {
        Self { hour: 7, minute: 0 }
    }
}

impl fmt::Display for AlarmTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<(u8, u8)> for AlarmTime {
    type Error = String;

    fn try_from((hour, minute): (u8, u8)) -> Result<Self, Self::Error> {
        Self::new(hour, minute).ok_or_else(|| format!("alarm {hour}:{minute} is out of range"))
    }
}

impl From<AlarmTime> for (u8, u8) {
    fn from(alarm: AlarmTime) -> Self {
        (alarm.hour, alarm.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub ssid: String,
    pub password: String,
    #[serde(rename = "summer")]
    pub summer_offset_hours: u8,
    #[serde(rename = "winter")]
    pub winter_offset_hours: u8,
    #[serde(rename = "alarm_hour")]
    pub alarm: AlarmTime,
}

/// Settings as found on disk; every field may be absent.
#[derive(Debug, Default, Deserialize)]
struct StoredSettings {
    ssid: Option<String>,
    password: Option<String>,
    summer: Option<u8>,
    winter: Option<u8>,
    alarm_hour: Option<AlarmTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSettings {
    pub settings: Settings,
    /// Offsets or alarm were missing and got filled in; the caller should write them back.
    pub defaults_applied: bool,
}

impl Settings {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            summer_offset_hours: DEFAULT_SUMMER_OFFSET_HOURS,
            winter_offset_hours: DEFAULT_WINTER_OFFSET_HOURS,
            alarm: AlarmTime::default(),
        }
    }

    pub fn from_json(raw: &[u8]) -> Result<LoadedSettings, SettingsError> {
        let stored: StoredSettings = serde_json::from_slice(raw)?;

        let ssid = stored
            .ssid
            .filter(|ssid| !ssid.is_empty())
            .ok_or(SettingsError::Missing("ssid"))?;
        let password = stored.password.ok_or(SettingsError::Missing("password"))?;

        let defaults_applied =
            stored.summer.is_none() || stored.winter.is_none() || stored.alarm_hour.is_none();

        let mut settings = Self {
            ssid,
            password,
            summer_offset_hours: stored.summer.unwrap_or(DEFAULT_SUMMER_OFFSET_HOURS),
            winter_offset_hours: stored.winter.unwrap_or(DEFAULT_WINTER_OFFSET_HOURS),
            alarm: stored.alarm_hour.unwrap_or_default(),
        };
        settings.sanitize();

        Ok(LoadedSettings {
            settings,
            defaults_applied,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, SettingsError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn sanitize(&mut self) {
        self.summer_offset_hours = self.summer_offset_hours.min(MAX_OFFSET_HOURS);
        self.winter_offset_hours = self.winter_offset_hours.min(MAX_OFFSET_HOURS);
    }
}

/// Turns a store lookup into the settings the device boots with.
///
/// `location` names the file or NVS key in the diagnostic.
pub fn require_settings<E: fmt::Display>(
    loaded: Result<Option<LoadedSettings>, E>,
    location: &str,
) -> Result<LoadedSettings, StartupError> {
    match loaded {
        Ok(Some(loaded)) => Ok(loaded),
        Ok(None) => Err(StartupError::ConfigurationMissing(format!(
            "{location} not found"
        ))),
        Err(err) => Err(StartupError::ConfigurationMissing(format!(
            "{location}: {err:#}"
        ))),
    }
}
