//! Small shared helpers — title sanitization, byte formatting, filename extraction

use reqwest::header::{CONTENT_DISPOSITION, HeaderMap};

/// Sanitize a post title into a filesystem-safe file stem
///
/// Short-video titles are routinely padded with `#hashtag` runs; those are
/// stripped entirely rather than escaped, then filesystem-reserved
/// characters are replaced and whitespace collapsed. An empty result falls
/// back to "untitled".
pub fn sanitize_title(title: &str) -> String {
    let mut cleaned = String::with_capacity(title.len());
    let mut in_hashtag = false;
    for c in title.chars() {
        if c == '#' {
            in_hashtag = true;
            continue;
        }
        if in_hashtag {
            // A hashtag run ends at whitespace
            if c.is_whitespace() {
                in_hashtag = false;
            } else {
                continue;
            }
        }
        cleaned.push(c);
    }

    let replaced: String = cleaned
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "untitled".to_string()
    } else {
        collapsed
    }
}

/// Format a byte count as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Derive a filename from response headers or the request URL
///
/// Prefers `Content-Disposition: attachment; filename=...`, then the last
/// path component of the URL (percent-decoded). Returns `None` when
/// neither yields a usable name, so the caller falls back to the
/// title-derived name.
pub fn extract_filename(headers: &HeaderMap, url: &str) -> Option<String> {
    if let Some(value) = headers.get(CONTENT_DISPOSITION).and_then(|v| v.to_str().ok()) {
        if let Some(name) = parse_content_disposition(value) {
            return Some(name);
        }
    }

    filename_from_url(url)
}

/// The last path component of a URL, percent-decoded
///
/// Query strings and fragments are ignored; `None` when the path has no
/// usable component (bare host, trailing slash only).
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.filter(|s| !s.is_empty()).next_back()?;
    let decoded = urlencoding::decode(last).ok()?;
    let decoded = decoded.trim();
    if decoded.is_empty() {
        None
    } else {
        Some(decoded.to_string())
    }
}

fn parse_content_disposition(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(name) = part.strip_prefix("filename=") {
            let name = name.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}
