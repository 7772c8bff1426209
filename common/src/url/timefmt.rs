//! `%t`, `%T` and `%h` tokens in URL paths and name templates.
//!
//! - `%t<c>` formats the current instant, `<c>` is one of `aAbBdjyYmHMSUW` (`U` is Unix time)
//! - `%T<op><n>[S|M|H|d]` shifts the instant used by the following `%t` tokens; `op` is one of
//!   `+`, `-`, `*`, `/` or `%` (round down to a multiple), seconds are the default unit
//! - `%h` is the local host name
//!
//! Anything else after `%` is copied literally.

use super::UrlError;

pub(crate) const TIME_FORMATS: &[u8] = b"aAbBdjyYmHMSUW";

/// Host name of this machine, `localhost` when it cannot be determined.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn apply_modifier(time: i64, op: u8, amount: i64) -> i64 {
    match op {
        b'+' => time.saturating_add(amount),
        b'-' => time.saturating_sub(amount),
        b'*' => time.saturating_mul(amount),
        b'/' if amount != 0 => time / amount,
        b'%' if amount != 0 => time - time.rem_euclid(amount),
        _ => time,
    }
}

/// Parses the part of a `%T` token after the `T`; returns op, amount in seconds and width.
fn parse_modifier(rest: &[u8]) -> Option<(u8, i64, usize)> {
    let (op, mut idx) = match rest.first() {
        Some(op @ (b'+' | b'-' | b'*' | b'/' | b'%')) => (*op, 1),
        _ => (b'+', 0),
    };
    let digits_start = idx;
    while idx < rest.len() && rest[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == digits_start {
        return None;
    }
    let amount: i64 = std::str::from_utf8(&rest[digits_start..idx]).ok()?.parse().ok()?;
    let unit = match rest.get(idx) {
        Some(b'S') => Some(1),
        Some(b'M') => Some(60),
        Some(b'H') => Some(3600),
        Some(b'd') => Some(86400),
        _ => None,
    };
    match unit {
        Some(multiplier) => Some((op, amount.checked_mul(multiplier)?, idx + 1)),
        None => Some((op, amount, idx)),
    }
}

pub(crate) fn format_time(time: i64, format: u8) -> String {
    if format == b'U' {
        return time.to_string();
    }
    let Some(instant) = chrono::DateTime::from_timestamp(time, 0) else {
        return String::new();
    };
    let pattern = format!("%{}", format as char);
    instant
        .with_timezone(&chrono::Local)
        .format(&pattern)
        .to_string()
}

/// Validates the tokens of `template` and, when `time` is given, substitutes them.
///
/// Without a time the template is returned unchanged if every token is valid.
pub fn expand(
    template: &str,
    time: Option<chrono::DateTime<chrono::Local>>,
) -> Result<String, UrlError> {
    let bytes = template.as_bytes();
    let mut errors = UrlError::empty();
    let mut out = String::with_capacity(template.len());
    let mut current = time.map(|t| t.timestamp());
    let mut literal_start = 0;
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'%' {
            idx += 1;
            continue;
        }
        let token_start = idx;
        let width = match bytes.get(idx + 1) {
            Some(b't') => match bytes.get(idx + 2) {
                Some(c) if TIME_FORMATS.contains(c) => {
                    if let Some(now) = current {
                        out.push_str(&template[literal_start..token_start]);
                        out.push_str(&format_time(now, *c));
                        literal_start = token_start + 3;
                    }
                    3
                }
                _ => {
                    errors |= UrlError::TIME_FORMAT_INVALID;
                    2
                }
            },
            Some(b'T') => match parse_modifier(&bytes[idx + 2..]) {
                Some((op, amount, used)) => {
                    if let Some(now) = current {
                        out.push_str(&template[literal_start..token_start]);
                        current = Some(apply_modifier(now, op, amount));
                        literal_start = token_start + 2 + used;
                    }
                    2 + used
                }
                None => {
                    errors |= UrlError::TIME_MODIFIER_INVALID;
                    2
                }
            },
            Some(b'h') => {
                if current.is_some() {
                    out.push_str(&template[literal_start..token_start]);
                    out.push_str(&local_hostname());
                    literal_start = token_start + 2;
                }
                2
            }
            _ => 1,
        };
        idx += width;
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    if current.is_none() {
        return Ok(template.to_string());
    }
    out.push_str(&template[literal_start..]);
    Ok(out)
}
