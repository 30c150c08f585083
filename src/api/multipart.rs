//! `multipart/form-data` request bodies.

use anyhow::{anyhow, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// Extract the boundary parameter from a `Content-Type` header value.
pub fn boundary_from_content_type(value: &str) -> Option<String> {
    let mut params = value.split(';');
    let mime = params.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

/// Split a multipart body into parts.
pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut pos = find(body, &delimiter, 0).ok_or_else(|| anyhow!("multipart boundary not found"))?;
    let mut parts = Vec::new();

    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        pos = skip_line_break(body, pos)?;

        let header_end = find(body, b"\r\n\r\n", pos)
            .ok_or_else(|| anyhow!("multipart part headers truncated"))?;
        let headers = std::str::from_utf8(&body[pos..header_end])
            .map_err(|_| anyhow!("multipart part headers are not utf-8"))?;
        let data_start = header_end + 4;

        let mut next_delimiter = b"\r\n".to_vec();
        next_delimiter.extend_from_slice(&delimiter);
        let data_end = find(body, &next_delimiter, data_start)
            .ok_or_else(|| anyhow!("multipart closing boundary not found"))?;

        parts.push(parse_part(headers, &body[data_start..data_end])?);
        pos = data_end + 2;
    }
}

/// First part with the given field name.
pub fn find_part<'a>(parts: &'a [Part], name: &str) -> Option<&'a Part> {
    parts.iter().find(|part| part.name == name)
}

fn parse_part(headers: &str, data: &[u8]) -> Result<Part> {
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if key == "content-disposition" {
            for param in value.split(';').skip(1) {
                if let Some((k, v)) = param.split_once('=') {
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim().to_ascii_lowercase().as_str() {
                        "name" => name = Some(v),
                        "filename" => filename = Some(v),
                        _ => {}
                    }
                }
            }
        } else if key == "content-type" {
            content_type = Some(value.to_string());
        }
    }
    Ok(Part {
        name: name.ok_or_else(|| anyhow!("multipart part missing a field name"))?,
        filename,
        content_type,
        data: data.to_vec(),
    })
}

fn skip_line_break(body: &[u8], pos: usize) -> Result<usize> {
    if body[pos..].starts_with(b"\r\n") {
        Ok(pos + 2)
    } else {
        Err(anyhow!("malformed multipart boundary line"))
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}
