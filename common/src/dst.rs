//! UTC to local wall-clock conversion with a computed European-style DST rule.
//!
//! Summer time runs from 02:00 on the last Sunday of March until 03:00 on the
//! last Sunday of October. The boundary hours are compared against the fields
//! of the UTC timestamp being converted.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Weekday};

use crate::config::Settings;

const SPRING_FORWARD_HOUR: u32 = 2;
const FALL_BACK_HOUR: u32 = 3;

/// Day of month of the last Sunday, scanning backward from the 31st.
pub fn last_sunday(year: i32, month: u32) -> u32 {
    (1..=31)
        .rev()
        .find(|&day| {
            NaiveDate::from_ymd_opt(year, month, day)
                .is_some_and(|date| date.weekday() == Weekday::Sun)
        })
        .unwrap_or(1)
}

pub fn is_dst_active(utc: &NaiveDateTime) -> bool {
    let (day, hour) = (utc.day(), utc.hour());

    match utc.month() {
        3 => {
            let switch_day = last_sunday(utc.year(), 3);
            day > switch_day || (day == switch_day && hour >= SPRING_FORWARD_HOUR)
        }
        4..=9 => true,
        10 => {
            let switch_day = last_sunday(utc.year(), 10);
            day < switch_day || (day == switch_day && hour < FALL_BACK_HOUR)
        }
        _ => false,
    }
}

pub fn offset_seconds(utc: &NaiveDateTime, summer_offset_hours: u8, winter_offset_hours: u8) -> i64 {
    let hours = if is_dst_active(utc) {
        summer_offset_hours
    } else {
        winter_offset_hours
    };
    i64::from(hours) * 3_600
}

pub fn local_time(
    utc: &NaiveDateTime,
    summer_offset_hours: u8,
    winter_offset_hours: u8,
) -> NaiveDateTime {
    let offset = offset_seconds(utc, summer_offset_hours, winter_offset_hours);
    utc.checked_add_signed(Duration::seconds(offset))
        .unwrap_or(*utc)
}

/// First display line, exactly 20 columns: `HH:MM     DD-MM-YYYY`.
pub fn format_clock_line(local: &NaiveDateTime) -> String {
    local.format("%H:%M     %d-%m-%Y").to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTimeSample {
    pub text: String,
    pub local: NaiveDateTime,
}

impl LocalTimeSample {
    pub fn at(utc: &NaiveDateTime, settings: &Settings) -> Self {
        let local = local_time(
            utc,
            settings.summer_offset_hours,
            settings.winter_offset_hours,
        );
        Self {
            text: format_clock_line(&local),
            local,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn utc(year: i32, month: u32, day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(year, month, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn finds_last_sundays() {
        assert_eq!(last_sunday(2024, 3), 31);
        assert_eq!(last_sunday(2024, 10), 27);
        assert_eq!(last_sunday(2025, 3), 30);
        assert_eq!(last_sunday(2025, 10), 26);
        assert_eq!(last_sunday(2026, 3), 29);
        assert_eq!(last_sunday(2026, 10), 25);
        // 30-day month: scan starts from the last valid day.
        assert_eq!(last_sunday(2026, 4), 26);
    }

    #[test]
    fn summer_months_are_always_dst() {
        for month in 4..=9 {
            for day in [1, 15, 30] {
                for hour in [0, 2, 3, 23] {
                    assert!(is_dst_active(&utc(2026, month, day, hour)), "{month}/{day} {hour}h");
                }
            }
        }
    }

    #[test]
    fn winter_months_are_never_dst() {
        for month in [11, 12, 1, 2] {
            for day in [1, 15, 28] {
                for hour in [0, 2, 3, 23] {
                    assert!(!is_dst_active(&utc(2026, month, day, hour)), "{month}/{day} {hour}h");
                }
            }
        }
    }

    #[test]
    fn march_switches_at_two() {
        for year in 2024..=2030 {
            let sunday = last_sunday(year, 3);
            assert!(!is_dst_active(&utc(year, 3, sunday, 1)));
            assert!(is_dst_active(&utc(year, 3, sunday, 2)));
            assert!(!is_dst_active(&utc(year, 3, sunday - 1, 23)));
            if sunday < 31 {
                assert!(is_dst_active(&utc(year, 3, sunday + 1, 0)));
            }
        }
    }

    #[test]
    fn october_switches_at_three() {
        for year in 2024..=2030 {
            let sunday = last_sunday(year, 10);
            assert!(is_dst_active(&utc(year, 10, sunday, 2)));
            assert!(!is_dst_active(&utc(year, 10, sunday, 3)));
            assert!(is_dst_active(&utc(year, 10, sunday - 1, 23)));
            if sunday < 31 {
                assert!(!is_dst_active(&utc(year, 10, sunday + 1, 0)));
            }
        }
    }

    #[test]
    fn applies_seasonal_offset() {
        let summer = local_time(&utc(2026, 7, 1, 12), 2, 1);
        let winter = local_time(&utc(2026, 1, 1, 12), 2, 1);

        assert_eq!(summer, utc(2026, 7, 1, 14));
        assert_eq!(winter, utc(2026, 1, 1, 13));
    }

    #[test]
    fn offset_rolls_over_the_date() {
        let local = local_time(&utc(2026, 12, 31, 23), 2, 1);
        assert_eq!(local, utc(2027, 1, 1, 0));
        assert_eq!(format_clock_line(&local), "00:00     01-01-2027");
    }

    #[test]
    fn sample_uses_settings_offsets() {
        let mut settings = Settings::new("Home", "pw");
        settings.summer_offset_hours = 3;
        let sample = LocalTimeSample::at(&utc(2026, 6, 10, 5), &settings);

        assert_eq!(sample.text, "08:00     10-06-2026");
        assert_eq!(sample.text.len(), 20);
    }
}
