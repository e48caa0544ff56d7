//! Slash-delimited document pointers (RFC 6901 escaping).

use crate::error::PointerError;

/// Split a pointer into unescaped segments. `""` is the root.
pub fn parse(pointer: &str) -> Result<Vec<String>, PointerError> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer
        .strip_prefix('/')
        .ok_or_else(|| PointerError::MissingLeadingSlash(pointer.to_string()))?;
    rest.split('/').map(unescape).collect()
}

/// Join segments back into a pointer.
pub fn format<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for seg in segments {
        out.push('/');
        out.push_str(&seg.as_ref().replace('~', "~0").replace('/', "~1"));
    }
    out
}

fn unescape(segment: &str) -> Result<String, PointerError> {
    if !segment.contains('~') {
        return Ok(segment.to_string());
    }
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(PointerError::BadEscape(segment.to_string())),
        }
    }
    Ok(out)
}

/// Resolve a sequence index segment. `-` (or `len`) is the append slot.
pub(crate) fn seq_index(segment: &str, len: usize) -> Result<usize, PointerError> {
    if segment == "-" {
        return Ok(len);
    }
    if segment.len() > 1 && segment.starts_with('0') {
        return Err(PointerError::BadIndex(segment.to_string()));
    }
    segment
        .parse::<usize>()
        .map_err(|_| PointerError::BadIndex(segment.to_string()))
}
