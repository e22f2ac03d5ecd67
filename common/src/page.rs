use crate::config::Settings;

/// Served when the template file cannot be read.
pub const FALLBACK_TEMPLATE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Clock settings</title></head>
<body>
<p>HTML Missing</p>
<form method="post" action="/save">
SSID <input name="ssid" value="{SSID}"><br>
Password <input name="password" value="{PASSWORD}"><br>
Summer offset <input name="summer" value="{SUMMER}"><br>
Winter offset <input name="winter" value="{WINTER}"><br>
Alarm <input name="alarm" value="{ALARM}"><br>
<button type="submit">Save</button>
</form>
</body>
</html>
"#;

/// Fills the placeholders in one left-to-right pass, so substituted values
/// are never scanned for further placeholders.
pub fn render_settings_page(template: Option<&str>, settings: &Settings, ip: Option<&str>) -> String {
    let template = template.unwrap_or(FALLBACK_TEMPLATE);
    let values = [
        ("{SSID}", escape_html(&settings.ssid)),
        ("{PASSWORD}", escape_html(&settings.password)),
        ("{SUMMER}", settings.summer_offset_hours.to_string()),
        ("{WINTER}", settings.winter_offset_hours.to_string()),
        ("{ALARM}", settings.alarm.to_string()),
        ("{IP}", escape_html(ip.unwrap_or(""))),
    ];

    let mut page = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        page.push_str(&rest[..start]);
        let tail = &rest[start..];
        match values.iter().find(|(placeholder, _)| tail.starts_with(placeholder)) {
            Some((placeholder, value)) => {
                page.push_str(value);
                rest = &tail[placeholder.len()..];
            }
            None => {
                page.push('{');
                rest = &tail[1..];
            }
        }
    }
    page.push_str(rest);
    page
}

pub fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
