//! Total HTTP/1.x request parsing for the settings endpoint.
//!
//! Nothing here fails on malformed input: missing pieces fall back to
//! defaults and broken escapes pass through untouched.

use std::{
    collections::HashMap,
    io::{self, ErrorKind, Read},
};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Upper bound on a request body regardless of the advertised `Content-Length`.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
    }

    /// Advertised body length; 0 when absent or not a number.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn form(&self) -> HashMap<String, String> {
        parse_form(&self.body_text())
    }
}

/// A request whose head has been parsed but whose body may still be arriving.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    request: Request,
    expected_body: Option<usize>,
}

impl PendingRequest {
    pub fn parse(initial: &[u8]) -> Self {
        let (head, body_prefix) = match find(initial, HEADER_TERMINATOR) {
            Some(index) => (&initial[..index], &initial[index + HEADER_TERMINATOR.len()..]),
            None => (initial, &[][..]),
        };
        let head = String::from_utf8_lossy(head);
        let mut lines = head.lines();

        let mut parts = lines.next().unwrap_or_default().split_whitespace();
        let method = parts.next().unwrap_or("GET").to_string();
        let path = parts.next().unwrap_or("/").to_string();

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        let mut request = Request {
            method,
            path,
            headers,
            body: Vec::new(),
        };

        let expected_body = if request.is_post() {
            request.body.extend_from_slice(body_prefix);
            request
                .header("content-length")
                .and_then(|value| value.trim().parse::<usize>().ok())
                .map(|length| length.min(MAX_BODY_BYTES))
        } else {
            None
        };

        Self {
            request,
            expected_body,
        }
    }

    /// Body bytes still owed by the peer according to `Content-Length`.
    pub fn remaining(&self) -> usize {
        self.expected_body
            .map(|expected| expected.saturating_sub(self.request.body.len()))
            .unwrap_or(0)
    }

    pub fn push_body(&mut self, bytes: &[u8]) {
        let take = self.remaining().min(bytes.len());
        self.request.body.extend_from_slice(&bytes[..take]);
    }

    pub fn finish(mut self) -> Request {
        if let Some(expected) = self.expected_body {
            self.request.body.truncate(expected);
        }
        self.request
    }
}

/// Parses `initial` and keeps reading from `reader` until the body is complete
/// or the peer stops sending. A short body is not an error.
pub fn read_request<R: Read>(
    initial: &[u8],
    reader: &mut R,
    chunk_size: usize,
) -> io::Result<Request> {
    let mut pending = PendingRequest::parse(initial);
    let mut chunk = vec![0_u8; chunk_size.max(1)];

    while pending.remaining() > 0 {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => pending.push_body(&chunk[..read]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(pending.finish())
}

/// `+` becomes a space and `%XX` the byte it names; anything else is copied.
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' => {
                let high = bytes.get(index + 1).and_then(hex_value);
                let low = bytes.get(index + 2).and_then(hex_value);
                if let (Some(high), Some(low)) = (high, low) {
                    decoded.push((high << 4) | low);
                    index += 3;
                } else {
                    decoded.push(b'%');
                    index += 1;
                }
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

pub fn parse_form(body: &str) -> HashMap<String, String> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (url_decode(key), url_decode(value)))
        .collect()
}

fn hex_value(byte: &u8) -> Option<u8> {
    char::from(*byte)
        .to_digit(16)
        .and_then(|digit| u8::try_from(digit).ok())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
