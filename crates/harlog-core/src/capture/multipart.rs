//! Best-effort `multipart/form-data` capture.
//!
//! Text fields become `{name, value}` params. File parts become
//! `{name, fileName, contentType, value}` where the value is an inline
//! `data:` URL, unless the field is redacted, in which case only the file
//! metadata and a redaction marker are kept.

use crate::har::Param;
use crate::redaction::{redact_str, RedactionRule};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub name: Option<String>,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Extract the `boundary` parameter from a Content-Type header.
pub fn extract_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let boundary = value.trim().trim_matches('"');
            (!boundary.is_empty()).then(|| boundary.to_string())
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// Split a multipart body into parts. Returns `None` if the body does not
/// contain the boundary at all.
pub fn parse(body: &[u8], boundary: &str) -> Option<Vec<Part>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut cursor = find(body, &delimiter, 0)? + delimiter.len();
    let mut parts = Vec::new();

    loop {
        if body[cursor..].starts_with(b"--") {
            break;
        }
        // Skip the line break after the delimiter.
        if body[cursor..].starts_with(b"\r\n") {
            cursor += 2;
        } else if body[cursor..].starts_with(b"\n") {
            cursor += 1;
        }

        let Some(next) = find(body, &delimiter, cursor) else {
            break;
        };
        let raw = &body[cursor..next];
        cursor = next + delimiter.len();

        if let Some(part) = parse_part(raw) {
            parts.push(part);
        }
        if cursor >= body.len() {
            break;
        }
    }

    Some(parts)
}

fn parse_part(raw: &[u8]) -> Option<Part> {
    let (head_end, sep_len) = match find(raw, b"\r\n\r\n", 0) {
        Some(pos) => (pos, 4),
        None => (find(raw, b"\n\n", 0)?, 2),
    };

    let headers = String::from_utf8_lossy(&raw[..head_end]);
    let mut data = &raw[head_end + sep_len..];
    if data.ends_with(b"\r\n") {
        data = &data[..data.len() - 2];
    } else if data.ends_with(b"\n") {
        data = &data[..data.len() - 1];
    }

    let mut part = Part {
        name: None,
        file_name: None,
        content_type: None,
        data: data.to_vec(),
    };

    for line in headers.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "content-disposition" => {
                for attr in value.split(';') {
                    let Some((k, v)) = attr.trim().split_once('=') else {
                        continue;
                    };
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim() {
                        "name" => part.name = Some(v),
                        "filename" => part.file_name = Some(v),
                        _ => {}
                    }
                }
            }
            "content-type" => part.content_type = Some(value.to_string()),
            _ => {}
        }
    }

    Some(part)
}

/// Inline a file's bytes as a `data:` URL.
pub fn data_url(content_type: &str, file_name: &str, data: &[u8]) -> String {
    format!(
        "data:{};name={};base64,{}",
        content_type,
        file_name,
        STANDARD.encode(data)
    )
}

/// Convert parsed parts into HAR params, honoring redaction.
pub fn to_params(parts: Vec<Part>, rule: &RedactionRule) -> Vec<Param> {
    parts
        .into_iter()
        .filter_map(|part| {
            let name = part.name?;
            let redacted = rule.is_redacted(&name);

            let param = match part.file_name {
                Some(file_name) => {
                    let content_type = part
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string());
                    let value = if redacted {
                        redact_str(&String::from_utf8_lossy(&part.data))
                    } else {
                        data_url(&content_type, &file_name, &part.data)
                    };
                    Param {
                        name,
                        value: Some(value),
                        file_name: Some(file_name),
                        content_type: Some(content_type),
                    }
                }
                None => {
                    let text = String::from_utf8_lossy(&part.data).into_owned();
                    let value = if redacted { redact_str(&text) } else { text };
                    Param::field(name, value)
                }
            };
            Some(param)
        })
        .collect()
}
