use chrono::{NaiveDateTime, Timelike};

use crate::{
    config::{AlarmTime, ClockConfig, Settings},
    dst::LocalTimeSample,
    state::SharedState,
};

pub const SYNC_ERROR_MESSAGE: &str = "Time sync error";
pub const CONNECTING_MESSAGE: &str = "Connecting WiFi";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayAction {
    Clear,
    Write { text: String, row: u8, col: u8 },
    Backlight(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockPhase {
    /// Nothing rendered yet; the clock has not been synchronized.
    Startup,
    Normal { backlight_on_since: u64 },
    /// Alarm fired for `alarm`; blinks until the alarm setting changes.
    AlarmBlinking { alarm: AlarmTime },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStatus {
    Pending,
    Failed { at_secs: u64 },
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct ClockInput<'a> {
    pub now_utc: NaiveDateTime,
    /// Monotonic seconds, used for the backlight timeout.
    pub now_secs: u64,
    pub settings: &'a Settings,
    pub overlay: Option<&'a str>,
    pub ip: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ClockEngine {
    backlight_timeout_secs: u64,
    sync_retry_secs: u64,
    rows: u8,

    phase: ClockPhase,
    sync: SyncStatus,
    backlight_on: bool,

    last_displayed_text: Option<String>,
    last_alarm: Option<AlarmTime>,
    last_ip: Option<String>,
}

impl ClockEngine {
    pub fn new(config: &ClockConfig, backlight_on: bool) -> Self {
        Self {
            backlight_timeout_secs: config.backlight_timeout_secs,
            sync_retry_secs: config.ntp_retry_secs,
            rows: config.display_rows.max(1),
            phase: ClockPhase::Startup,
            sync: SyncStatus::Pending,
            backlight_on,
            last_displayed_text: None,
            last_alarm: None,
            last_ip: None,
        }
    }

    pub fn phase(&self) -> ClockPhase {
        self.phase
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.phase, ClockPhase::AlarmBlinking { .. })
    }

    pub fn backlight_on(&self) -> bool {
        self.backlight_on
    }

    /// True before the first successful synchronization, rate limited after a failure.
    pub fn needs_time_sync(&self, now_secs: u64) -> bool {
        match self.sync {
            SyncStatus::Pending => true,
            SyncStatus::Failed { at_secs } => {
                now_secs.saturating_sub(at_secs) >= self.sync_retry_secs
            }
            SyncStatus::Done => false,
        }
    }

    pub fn record_time_sync(&mut self, succeeded: bool, now_secs: u64) {
        self.sync = if succeeded {
            SyncStatus::Done
        } else {
            SyncStatus::Failed { at_secs: now_secs }
        };
    }

    pub fn tick(&mut self, input: ClockInput<'_>) -> Vec<DisplayAction> {
        let mut actions = Vec::new();

        self.rearm_if_alarm_changed(&input, &mut actions);
        let blinking = self.is_triggered();
        let sample = LocalTimeSample::at(&input.now_utc, input.settings);

        match input.overlay {
            Some(message) => self.render_overlay(message, &mut actions),
            None => {
                self.trigger_alarm_if_due(&sample, &input, &mut actions);
                self.redraw_if_changed(&sample, &input, &mut actions);
            }
        }

        if blinking {
            self.set_backlight(!self.backlight_on, &mut actions);
        }
        self.expire_backlight(input.now_secs, &mut actions);

        actions
    }

    /// Ticks against a snapshot of the shared settings, overlay and IP.
    pub fn tick_shared(
        &mut self,
        state: &SharedState,
        now_utc: NaiveDateTime,
        now_secs: u64,
    ) -> Vec<DisplayAction> {
        let settings = state.settings();
        let overlay = state.overlay();
        let ip = state.ip();

        self.tick(ClockInput {
            now_utc,
            now_secs,
            settings: &settings,
            overlay: overlay.as_deref().map(String::as_str).filter(|message| !message.is_empty()),
            ip: ip.as_deref().map(String::as_str),
        })
    }

    fn rearm_if_alarm_changed(&mut self, input: &ClockInput<'_>, actions: &mut Vec<DisplayAction>) {
        if let ClockPhase::AlarmBlinking { alarm } = self.phase {
            if alarm != input.settings.alarm {
                self.phase = ClockPhase::Normal {
                    backlight_on_since: input.now_secs,
                };
                self.set_backlight(true, actions);
            }
        }
    }

    fn trigger_alarm_if_due(
        &mut self,
        sample: &LocalTimeSample,
        input: &ClockInput<'_>,
        actions: &mut Vec<DisplayAction>,
    ) {
        if self.is_triggered() {
            return;
        }

        let alarm = input.settings.alarm;
        if sample.local.hour() == u32::from(alarm.hour())
            && sample.local.minute() == u32::from(alarm.minute())
        {
            self.phase = ClockPhase::AlarmBlinking { alarm };
            self.set_backlight(true, actions);
        }
    }

    fn redraw_if_changed(
        &mut self,
        sample: &LocalTimeSample,
        input: &ClockInput<'_>,
        actions: &mut Vec<DisplayAction>,
    ) {
        let alarm = input.settings.alarm;
        let unchanged = self.last_displayed_text.as_deref() == Some(sample.text.as_str())
            && self.last_alarm == Some(alarm)
            && self.last_ip.as_deref() == input.ip;
        if unchanged {
            return;
        }

        actions.push(DisplayAction::Clear);
        actions.push(write_at(&sample.text, 0));
        actions.push(write_at(&format!("Alarm: {alarm}"), 1));
        if let Some(ip) = input.ip {
            if self.rows > 2 {
                actions.push(write_at(&format!("IP: {ip}"), 2));
            }
        }

        self.last_displayed_text = Some(sample.text.clone());
        self.last_alarm = Some(alarm);
        self.last_ip = input.ip.map(str::to_string);

        if self.phase == ClockPhase::Startup {
            self.phase = ClockPhase::Normal {
                backlight_on_since: input.now_secs,
            };
            self.set_backlight(true, actions);
        }
    }

    fn render_overlay(&mut self, message: &str, actions: &mut Vec<DisplayAction>) {
        actions.push(DisplayAction::Clear);
        for (row, line) in (0..self.rows).zip(message.split('\n')) {
            actions.push(write_at(line, row));
        }

        // Force a full clock redraw once the overlay goes away.
        self.last_displayed_text = None;

        // Startup diagnostics must be readable before the first clock render.
        if self.phase == ClockPhase::Startup && !self.backlight_on {
            self.set_backlight(true, actions);
        }
    }

    fn expire_backlight(&mut self, now_secs: u64, actions: &mut Vec<DisplayAction>) {
        let ClockPhase::Normal { backlight_on_since } = self.phase else {
            return;
        };

        if self.backlight_on
            && now_secs.saturating_sub(backlight_on_since) > self.backlight_timeout_secs
        {
            self.set_backlight(false, actions);
        }
    }

    fn set_backlight(&mut self, on: bool, actions: &mut Vec<DisplayAction>) {
        self.backlight_on = on;
        actions.push(DisplayAction::Backlight(on));
    }
}

fn write_at(text: &str, row: u8) -> DisplayAction {
    DisplayAction::Write {
        text: text.to_string(),
        row,
        col: 0,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Winter date, so local time is UTC + 1 with default offsets.
    fn utc(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 15)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn settings_with_alarm(hour: u8, minute: u8) -> Settings {
        let mut settings = Settings::new("Home", "pw");
        settings.alarm = AlarmTime::new(hour, minute).unwrap();
        settings
    }

    fn input<'a>(now_utc: NaiveDateTime, now_secs: u64, settings: &'a Settings) -> ClockInput<'a> {
        ClockInput {
            now_utc,
            now_secs,
            settings,
            overlay: None,
            ip: None,
        }
    }

    fn engine() -> ClockEngine {
        ClockEngine::new(&ClockConfig::default(), false)
    }

    fn backlight_changes(actions: &[DisplayAction]) -> Vec<bool> {
        actions
            .iter()
            .filter_map(|action| match action {
                DisplayAction::Backlight(on) => Some(*on),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn first_render_draws_clock_and_lights_backlight() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();

        let actions = engine.tick(input(utc(9, 30, 0), 1, &settings));

        assert_eq!(
            actions,
            vec![
                DisplayAction::Clear,
                write_at("10:30     15-01-2026", 0),
                write_at("Alarm: 07:00", 1),
                DisplayAction::Backlight(true),
            ]
        );
        assert_eq!(engine.phase(), ClockPhase::Normal { backlight_on_since: 1 });
    }

    #[test]
    fn unchanged_tick_is_a_no_op() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();

        let _ = engine.tick(input(utc(9, 30, 0), 1, &settings));
        let actions = engine.tick(input(utc(9, 30, 1), 2, &settings));

        assert!(actions.is_empty());
    }

    #[test]
    fn minute_change_redraws_without_touching_backlight() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();

        let _ = engine.tick(input(utc(9, 30, 59), 1, &settings));
        let actions = engine.tick(input(utc(9, 31, 0), 2, &settings));

        assert_eq!(actions.first(), Some(&DisplayAction::Clear));
        assert!(backlight_changes(&actions).is_empty());
    }

    #[test]
    fn alarm_fires_at_the_minute_and_blinks() {
        // Local 07:00 is 06:00 UTC in winter.
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();

        let _ = engine.tick(input(utc(5, 59, 58), 1, &settings));
        let _ = engine.tick(input(utc(5, 59, 59), 2, &settings));
        assert!(!engine.is_triggered());

        let actions = engine.tick(input(utc(6, 0, 0), 3, &settings));
        assert!(engine.is_triggered());
        assert_eq!(backlight_changes(&actions), vec![true]);
        assert!(engine.backlight_on());

        let mut observed = Vec::new();
        for second in 1..=4 {
            let actions = engine.tick(input(utc(6, 0, second), 3 + u64::from(second), &settings));
            observed.extend(backlight_changes(&actions));
        }
        assert_eq!(observed, vec![false, true, false, true]);
    }

    #[test]
    fn alarm_keeps_blinking_after_its_minute() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();

        let _ = engine.tick(input(utc(6, 0, 0), 1, &settings));
        let actions = engine.tick(input(utc(8, 0, 0), 7_200, &settings));

        assert!(engine.is_triggered());
        assert_eq!(backlight_changes(&actions), vec![false]);
    }

    #[test]
    fn changing_the_alarm_rearms_detection() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();
        let _ = engine.tick(input(utc(6, 0, 0), 1, &settings));
        assert!(engine.is_triggered());

        let moved = settings_with_alarm(7, 5);
        let actions = engine.tick(input(utc(6, 0, 1), 2, &moved));

        assert!(!engine.is_triggered());
        assert_eq!(engine.phase(), ClockPhase::Normal { backlight_on_since: 2 });
        assert!(actions.contains(&write_at("Alarm: 07:05", 1)));

        let actions = engine.tick(input(utc(6, 5, 0), 300, &moved));
        assert!(engine.is_triggered());
        assert_eq!(backlight_changes(&actions), vec![true]);
    }

    #[test]
    fn backlight_turns_off_after_timeout() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();
        let _ = engine.tick(input(utc(9, 0, 0), 10, &settings));

        let actions = engine.tick(input(utc(9, 0, 1), 1_009, &settings));
        assert!(backlight_changes(&actions).is_empty());

        let actions = engine.tick(input(utc(9, 0, 2), 1_010, &settings));
        assert_eq!(backlight_changes(&actions), vec![false]);

        let actions = engine.tick(input(utc(9, 0, 3), 1_011, &settings));
        assert!(backlight_changes(&actions).is_empty());
    }

    #[test]
    fn overlay_replaces_clock_every_tick() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();
        let overlay = ClockInput {
            overlay: Some("WiFi Conn. failed!\nFlash manually."),
            ..input(utc(9, 0, 0), 1, &settings)
        };
        let drawn = vec![
            DisplayAction::Clear,
            write_at("WiFi Conn. failed!", 0),
            write_at("Flash manually.", 1),
        ];

        let first = engine.tick(overlay);
        let mut lit = drawn.clone();
        lit.push(DisplayAction::Backlight(true));
        assert_eq!(first, lit);

        for second in 1..30 {
            let actions = engine.tick(ClockInput {
                now_secs: 1 + second,
                ..overlay
            });
            assert_eq!(actions, drawn);
        }
        assert!(engine.backlight_on());
        assert_eq!(engine.phase(), ClockPhase::Startup);
    }

    #[test]
    fn startup_overlay_keeps_an_already_lit_backlight() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = ClockEngine::new(&ClockConfig::default(), true);

        let actions = engine.tick(ClockInput {
            overlay: Some("Connecting WiFi"),
            ..input(utc(9, 0, 0), 1, &settings)
        });

        assert!(backlight_changes(&actions).is_empty());
    }

    #[test]
    fn overlay_suppresses_alarm_detection() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();
        let overlay = ClockInput {
            overlay: Some("Time sync error"),
            ..input(utc(6, 0, 0), 1, &settings)
        };

        let _ = engine.tick(overlay);

        assert!(!engine.is_triggered());
    }

    #[test]
    fn clock_returns_when_overlay_clears() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();
        let _ = engine.tick(input(utc(9, 0, 0), 1, &settings));
        let _ = engine.tick(ClockInput {
            overlay: Some("busy"),
            ..input(utc(9, 0, 1), 2, &settings)
        });

        let actions = engine.tick(input(utc(9, 0, 2), 3, &settings));

        assert_eq!(actions.first(), Some(&DisplayAction::Clear));
        assert!(actions.contains(&write_at("10:00     15-01-2026", 0)));
    }

    #[test]
    fn ip_change_redraws_third_row() {
        let settings = settings_with_alarm(7, 0);
        let mut engine = engine();
        let _ = engine.tick(input(utc(9, 0, 0), 1, &settings));

        let actions = engine.tick(ClockInput {
            ip: Some("192.168.1.20"),
            ..input(utc(9, 0, 1), 2, &settings)
        });

        assert!(actions.contains(&write_at("IP: 192.168.1.20", 2)));
    }

    #[test]
    fn shared_state_feeds_the_engine() {
        let state = SharedState::new(settings_with_alarm(7, 0));
        state.set_ip("10.0.0.7");
        let mut engine = engine();

        let actions = engine.tick_shared(&state, utc(9, 0, 0), 1);
        assert!(actions.contains(&write_at("IP: 10.0.0.7", 2)));

        state.set_overlay("Connecting WiFi");
        let actions = engine.tick_shared(&state, utc(9, 0, 1), 2);
        assert_eq!(actions, vec![DisplayAction::Clear, write_at("Connecting WiFi", 0)]);

        state.set_overlay("");
        let actions = engine.tick_shared(&state, utc(9, 0, 2), 3);
        assert!(actions.contains(&write_at("10:00     15-01-2026", 0)));
    }

    #[test]
    fn time_sync_is_retried_after_failure() {
        let mut engine = engine();
        assert!(engine.needs_time_sync(0));

        engine.record_time_sync(false, 5);
        assert!(!engine.needs_time_sync(6));
        assert!(engine.needs_time_sync(65));

        engine.record_time_sync(true, 65);
        assert!(!engine.needs_time_sync(1_000));
    }
}
