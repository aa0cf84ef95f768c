//! `multipart/form-data` bodies sent by twine and `nuget push`

use bytes::Bytes;

use crate::error::ParseError;

/// One form field
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl Part {
    /// Field value as text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Boundary parameter of a `Content-Type: multipart/form-data` value
pub fn boundary(content_type: &str) -> Option<String> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().to_ascii_lowercase().starts_with("multipart/") {
        return None;
    }
    params.split(';').find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// `name="x"; filename="y"` parameters of Content-Disposition
fn disposition_param(value: &str, key: &str) -> Option<String> {
    value.split(';').find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.trim()
            .eq_ignore_ascii_case(key)
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

/// Split a body into its parts
pub fn parse(body: &Bytes, boundary: &str) -> Result<Vec<Part>, ParseError> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();
    let mut at = find(body, delimiter, 0)
        .ok_or_else(|| ParseError::InvalidBody("multipart boundary not found".to_string()))?;
    let mut parts = Vec::new();

    loop {
        at += delimiter.len();
        if body.get(at..at + 2) == Some(b"--") {
            break;
        }
        // Skip the CRLF after the delimiter
        at = find(body, b"\r\n", at)
            .ok_or_else(|| ParseError::InvalidBody("truncated multipart body".to_string()))?
            + 2;

        let headers_end = find(body, b"\r\n\r\n", at)
            .ok_or_else(|| ParseError::InvalidBody("multipart part without headers".to_string()))?;
        let head = String::from_utf8_lossy(&body[at..headers_end]).into_owned();
        let data_start = headers_end + 4;

        let next = find(body, delimiter, data_start)
            .ok_or_else(|| ParseError::InvalidBody("unterminated multipart part".to_string()))?;
        // The CRLF before the next delimiter belongs to the framing, never to the headers
        let data_end = if next >= data_start + 2 && &body[next - 2..next] == b"\r\n" {
            next - 2
        } else {
            next
        };

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in head.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "content-disposition" => {
                    name = disposition_param(value, "name");
                    filename = disposition_param(value, "filename");
                }
                "content-type" => content_type = Some(value.trim().to_string()),
                _ => {}
            }
        }

        parts.push(Part {
            name: name.unwrap_or_default(),
            filename,
            content_type,
            data: body.slice(data_start..data_end),
        });
        at = next;
    }
    Ok(parts)
}
