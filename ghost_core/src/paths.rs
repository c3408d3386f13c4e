//! Logical path handling.
//!
//! Every file the ghost layer touches is addressed by a logical path such as
//! `data/bots/bot1/qna/faq.json`: forward slashes, no leading `./` or `/`,
//! no `.` or `..` segments. Both drivers receive paths in this form.

use crate::error::{Error, Result};

/// Normalize a logical path.
///
/// Backslashes become forward slashes, empty and `.` segments are dropped and
/// `..` pops the previous segment. A `..` that would climb above the root is
/// rejected.
pub fn normalize(path: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() {
                    return Err(Error::invalid_path(path, "escapes the storage root"));
                }
            }
            other => segments.push(other),
        }
    }

    Ok(segments.join("/"))
}

/// Join path fragments and normalize the result.
pub fn join(parts: &[&str]) -> Result<String> {
    normalize(&parts.join("/"))
}

/// Whether `path` is `base` itself or lives beneath it.
///
/// Matching is per segment: `data/bots/bot1` is not under `data/bots/bot`.
/// An empty base contains everything.
pub fn is_under(path: &str, base: &str) -> bool {
    if base.is_empty() {
        return true;
    }
    match path.strip_prefix(base) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Strip `base` from `path`, returning the remainder without a leading slash.
pub fn relative_to<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    if !is_under(path, base) {
        return None;
    }
    if base.is_empty() {
        return Some(path);
    }
    Some(path[base.len()..].trim_start_matches('/'))
}

/// Parent folder of a logical path (empty for top-level entries).
pub fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// First segment of a relative path, if the path has more than one segment.
pub fn top_folder(relative: &str) -> Option<&str> {
    relative.split_once('/').map(|(first, _)| first)
}

/// Validate a bot identifier.
///
/// Ids are at least three characters of ASCII letters, digits, `_` or `-`,
/// starting and ending with a letter or digit.
pub fn validate_bot_id(id: &str) -> Result<()> {
    let bytes = id.as_bytes();
    if bytes.len() < 3 {
        return Err(Error::invalid_bot_id(id));
    }

    let edge_ok = |b: u8| b.is_ascii_alphanumeric();
    let inner_ok = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'-';

    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) || !bytes.iter().all(|&b| inner_ok(b))
    {
        return Err(Error::invalid_bot_id(id));
    }

    Ok(())
}
