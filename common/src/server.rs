use std::{collections::HashMap, fmt::Write as _};

use crate::{
    config::{
        AlarmTime, Settings, DEFAULT_SUMMER_OFFSET_HOURS, DEFAULT_WINTER_OFFSET_HOURS,
        MAX_OFFSET_HOURS, MAX_PASSWORD_BYTES, MAX_SSID_BYTES,
    },
    error::FormError,
    http::Request,
    page::render_settings_page,
    state::SharedState,
};

pub const SAVE_PATH: &str = "/save";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn html(body: String) -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: vec![
                ("Content-Type", "text/html".to_string()),
                ("Content-Length", body.len().to_string()),
                ("Connection", "close".to_string()),
            ],
            body: body.into_bytes(),
        }
    }

    pub fn see_other(location: &str) -> Self {
        Self {
            status: 303,
            reason: "See Other",
            headers: vec![
                ("Location", location.to_string()),
                ("Connection", "close".to_string()),
            ],
            body: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// Settings were replaced and should be persisted.
    Saved { response: Response, settings: Settings },
    /// A save was attempted with unusable values; nothing changed.
    Rejected { response: Response, error: FormError },
    Page { response: Response },
}

impl Outcome {
    pub fn response(&self) -> &Response {
        match self {
            Self::Saved { response, .. } | Self::Rejected { response, .. } | Self::Page { response } => {
                response
            }
        }
    }
}

pub fn is_save_request(request: &Request) -> bool {
    request.is_post() && request.path.starts_with(SAVE_PATH)
}

pub fn handle_request(request: &Request, state: &SharedState, template: Option<&str>) -> Outcome {
    if !is_save_request(request) {
        return Outcome::Page {
            response: settings_page(state, template),
        };
    }

    let current = state.settings();
    match apply_form(&current, &request.form()) {
        Ok(settings) => {
            state.replace_settings(settings.clone());
            Outcome::Saved {
                response: Response::see_other("/"),
                settings,
            }
        }
        Err(error) => Outcome::Rejected {
            response: settings_page(state, template),
            error,
        },
    }
}

/// Builds the settings record a form submission asks for.
///
/// Credentials and offsets always come from the form. The alarm is only
/// replaced when the form carries a non-empty `alarm` field.
pub fn apply_form(current: &Settings, form: &HashMap<String, String>) -> Result<Settings, FormError> {
    let alarm = match form.get("alarm").map(|value| value.trim()) {
        Some(value) if !value.is_empty() => AlarmTime::parse(value)?,
        _ => current.alarm,
    };

    Ok(Settings {
        ssid: bounded_text(form, "ssid", MAX_SSID_BYTES)?,
        password: bounded_text(form, "password", MAX_PASSWORD_BYTES)?,
        summer_offset_hours: parse_offset(form, "summer", DEFAULT_SUMMER_OFFSET_HOURS)?,
        winter_offset_hours: parse_offset(form, "winter", DEFAULT_WINTER_OFFSET_HOURS)?,
        alarm,
    })
}

/// Credentials longer than the radio accepts would only fail at the next boot.
fn bounded_text(
    form: &HashMap<String, String>,
    field: &'static str,
    max: usize,
) -> Result<String, FormError> {
    let value = form.get(field).cloned().unwrap_or_default();
    if value.len() > max {
        return Err(FormError::TooLong { field, max });
    }
    Ok(value)
}

fn parse_offset(
    form: &HashMap<String, String>,
    field: &'static str,
    default: u8,
) -> Result<u8, FormError> {
    let Some(value) = form.get(field) else {
        return Ok(default);
    };

    value
        .trim()
        .parse::<u8>()
        .ok()
        .filter(|hours| *hours <= MAX_OFFSET_HOURS)
        .ok_or_else(|| FormError::InvalidNumber {
            field,
            value: value.clone(),
        })
}

fn settings_page(state: &SharedState, template: Option<&str>) -> Response {
    let settings = state.settings();
    let ip = state.ip();
    Response::html(render_settings_page(
        template,
        &settings,
        ip.as_deref().map(String::as_str),
    ))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::http::PendingRequest;

    const TEMPLATE: &str = "ssid={SSID};summer={SUMMER};winter={WINTER};alarm={ALARM}";

    fn request(raw: &str) -> Request {
        PendingRequest::parse(raw.as_bytes()).finish()
    }

    fn post_save(body: &str) -> Request {
        request(&format!(
            "POST /save HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    }

    fn body_text(response: &Response) -> String {
        String::from_utf8(response.body.clone()).unwrap()
    }

    #[test]
    fn save_redirects_and_next_get_reflects_it() {
        let state = SharedState::new(Settings::new("Old", "old"));

        let outcome = handle_request(
            &post_save("ssid=Home&password=secret&summer=3&winter=0"),
            &state,
            Some(TEMPLATE),
        );
        let response = outcome.response();
        assert_eq!(response.status, 303);
        assert_eq!(response.header("location"), Some("/"));
        assert_eq!(response.header("connection"), Some("close"));
        assert!(matches!(outcome, Outcome::Saved { .. }));

        let outcome = handle_request(&request("GET / HTTP/1.1\r\n\r\n"), &state, Some(TEMPLATE));
        let response = outcome.response();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(body_text(response), "ssid=Home;summer=3;winter=0;alarm=07:00");
    }

    #[test]
    fn missing_offsets_use_defaults() {
        let current = Settings {
            summer_offset_hours: 5,
            winter_offset_hours: 4,
            ..Settings::new("Old", "old")
        };
        let form = crate::http::parse_form("ssid=Home");

        let updated = apply_form(&current, &form).unwrap();

        assert_eq!(updated.password, "");
        assert_eq!(updated.summer_offset_hours, 2);
        assert_eq!(updated.winter_offset_hours, 1);
    }

    #[test]
    fn malformed_offset_rejects_only_this_request() {
        let state = SharedState::new(Settings::new("Old", "old"));

        let outcome = handle_request(
            &post_save("ssid=Home&password=secret&summer=two&winter=1"),
            &state,
            Some(TEMPLATE),
        );

        match outcome {
            Outcome::Rejected { response, error } => {
                assert_eq!(response.status, 200);
                assert_eq!(
                    error,
                    FormError::InvalidNumber {
                        field: "summer",
                        value: "two".to_string()
                    }
                );
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(state.settings().ssid, "Old");
    }

    #[test]
    fn negative_or_huge_offsets_are_malformed() {
        let current = Settings::new("Old", "old");
        for body in ["winter=-1", "winter=15", "summer=300"] {
            let form = crate::http::parse_form(body);
            assert!(apply_form(&current, &form).is_err(), "{body}");
        }
    }

    #[test]
    fn save_keeps_alarm_unless_form_sets_it() {
        let current = Settings {
            alarm: AlarmTime::new(6, 15).unwrap(),
            ..Settings::new("Old", "old")
        };

        let kept = apply_form(&current, &crate::http::parse_form("ssid=Home")).unwrap();
        assert_eq!(kept.alarm, AlarmTime::new(6, 15).unwrap());

        let blank = apply_form(&current, &crate::http::parse_form("ssid=Home&alarm=")).unwrap();
        assert_eq!(blank.alarm, AlarmTime::new(6, 15).unwrap());

        let moved = apply_form(&current, &crate::http::parse_form("ssid=Home&alarm=05%3A45")).unwrap();
        assert_eq!(moved.alarm, AlarmTime::new(5, 45).unwrap());

        let bad = apply_form(&current, &crate::http::parse_form("alarm=5pm"));
        assert_eq!(bad, Err(FormError::InvalidAlarm("5pm".to_string())));
    }

    #[test]
    fn overlong_credentials_are_rejected() {
        let state = SharedState::new(Settings::new("Old", "old"));
        let ssid = "s".repeat(33);

        let outcome = handle_request(
            &post_save(&format!("ssid={ssid}&password=pw&summer=2&winter=1")),
            &state,
            Some(TEMPLATE),
        );

        match outcome {
            Outcome::Rejected { error, .. } => assert_eq!(
                error,
                FormError::TooLong {
                    field: "ssid",
                    max: 32
                }
            ),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(state.settings().ssid, "Old");

        let form = crate::http::parse_form(&format!("ssid=Home&password={}", "p".repeat(65)));
        assert_eq!(
            apply_form(&Settings::new("Old", "old"), &form),
            Err(FormError::TooLong {
                field: "password",
                max: 64
            })
        );

        let form = crate::http::parse_form(&format!("ssid={}&password={}", "s".repeat(32), "p".repeat(64)));
        assert!(apply_form(&Settings::new("Old", "old"), &form).is_ok());
    }

    #[test]
    fn anything_else_renders_the_page() {
        let state = SharedState::new(Settings::new("Home", "pw"));

        for raw in [
            "GET /save HTTP/1.1\r\n\r\n",
            "POST /other HTTP/1.1\r\nContent-Length: 7\r\n\r\nssid=x",
            "DELETE / HTTP/1.1\r\n\r\n",
            "",
        ] {
            let outcome = handle_request(&request(raw), &state, None);
            assert!(matches!(outcome, Outcome::Page { .. }), "{raw:?}");
            assert_eq!(outcome.response().status, 200);
        }
        assert_eq!(state.settings().ssid, "Home");
    }

    #[test]
    fn wire_format_matches_device_responses() {
        let redirect = Response::see_other("/").to_bytes();
        assert_eq!(
            String::from_utf8(redirect).unwrap(),
            "HTTP/1.1 303 See Other\r\nLocation: /\r\nConnection: close\r\n\r\n"
        );

        let page = Response::html("<p>hi</p>".to_string()).to_bytes();
        assert_eq!(
            String::from_utf8(page).unwrap(),
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 9\r\nConnection: close\r\n\r\n<p>hi</p>"
        );
    }
}
