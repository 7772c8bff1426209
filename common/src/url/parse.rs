use super::{
    KeyType, MAX_FINGERPRINT_LENGTH, MAX_HOST_LENGTH, MAX_PASSWORD_LENGTH, MAX_PATH_LENGTH,
    MAX_PORT_DIGITS, MAX_SERVER_LENGTH, MAX_SMTP_USER_LENGTH, MAX_USER_LENGTH, Scheme, SmtpAuth,
    UrlError, UrlParts, timefmt,
};

/// Resolves `<alias>` host references to real host names.
pub trait AliasResolver {
    fn resolve(&self, alias: &str) -> Option<String>;
}

impl AliasResolver for std::collections::HashMap<String, String> {
    fn resolve(&self, alias: &str) -> Option<String> {
        self.get(alias).cloned()
    }
}

#[derive(Default, Clone, Copy)]
pub struct ParseOptions<'a> {
    /// Substitute `%t`/`%T`/`%h` path tokens using this instant instead of only validating them
    pub time: Option<chrono::DateTime<chrono::Local>>,
    pub aliases: Option<&'a dyn AliasResolver>,
}

/// Parses a URL, failing if any defect was found.
pub fn parse(url: &str) -> Result<UrlParts, UrlError> {
    parse_with(url, &ParseOptions::default())
}

pub fn parse_with(url: &str, options: &ParseOptions) -> Result<UrlParts, UrlError> {
    let (parts, errors, _) = parse_raw(url, options);
    if errors.is_empty() {
        Ok(parts)
    } else {
        Err(errors)
    }
}

/// Parses a URL and returns whatever could be extracted together with all defects found.
///
/// Callers that only care about syntax use this to tolerate `UNKNOWN_SCHEME`.
pub fn parse_lenient(url: &str) -> (UrlParts, UrlError) {
    let (parts, errors, _) = parse_raw(url, &ParseOptions::default());
    (parts, errors)
}

struct Field {
    value: String,
    too_long: bool,
    /// delimiter that ended the field, `None` at end of input
    stop: Option<u8>,
}

fn hex_value(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|v| v as u8)
}

/// Reads up to the next unescaped delimiter in `stops`, decoding `\x` and `%XX` escapes.
///
/// Characters beyond `max` are skipped rather than stored so scanning always ends at the
/// delimiter the grammar expects next.
fn read_field(input: &[u8], pos: &mut usize, stops: &[u8], max: usize, plus_is_space: bool) -> Field {
    let mut out = Vec::new();
    let mut too_long = false;
    let mut stop = None;
    while *pos < input.len() {
        let c = input[*pos];
        if stops.contains(&c) {
            stop = Some(c);
            break;
        }
        let (decoded, width) = match c {
            b'\\' if *pos + 1 < input.len() => (input[*pos + 1], 2),
            b'%' if *pos + 2 < input.len() => {
                match (hex_value(input[*pos + 1]), hex_value(input[*pos + 2])) {
                    (Some(hi), Some(lo)) => (hi << 4 | lo, 3),
                    _ => (c, 1),
                }
            }
            b'+' if plus_is_space => (b' ', 1),
            _ => (c, 1),
        };
        *pos += width;
        if out.len() < max {
            out.push(decoded);
        } else {
            too_long = true;
        }
    }
    Field {
        value: String::from_utf8_lossy(&out).into_owned(),
        too_long,
        stop,
    }
}

/// Reads a `name=` keyword; returns the name without `=` or `None` if no `=` follows.
fn read_keyword<'a>(input: &'a [u8], pos: &mut usize, stops: &[u8]) -> Option<&'a [u8]> {
    let start = *pos;
    while *pos < input.len() && input[*pos] != b'=' && !stops.contains(&input[*pos]) {
        *pos += 1;
    }
    if *pos < input.len() && input[*pos] == b'=' {
        let name = &input[start..*pos];
        *pos += 1;
        Some(name)
    } else {
        None
    }
}

fn skip_to(input: &[u8], pos: &mut usize, stops: &[u8]) {
    while *pos < input.len() && !stops.contains(&input[*pos]) {
        if input[*pos] == b'\\' {
            *pos += 1;
        }
        *pos += 1;
    }
    *pos = (*pos).min(input.len());
}

#[derive(Default)]
struct Userinfo {
    user: String,
    smtp_auth: SmtpAuth,
    smtp_user: String,
    key_type: Option<KeyType>,
    fingerprint: String,
    password: Option<String>,
    errors: UrlError,
}

const USER_STOPS: &[u8] = b";:@/";

/// Parses `user[;param=value]*[:password]@`; returns `None` when the input has no `@` pivot.
fn read_userinfo(input: &[u8], pos: &mut usize) -> Option<Userinfo> {
    let mut info = Userinfo::default();
    let user = read_field(input, pos, USER_STOPS, MAX_USER_LENGTH, false);
    if user.too_long {
        info.errors |= UrlError::USER_TOO_LONG;
    }
    info.user = user.value;
    let mut stop = user.stop;
    while stop == Some(b';') {
        *pos += 1;
        match read_keyword(input, pos, USER_STOPS) {
            Some(b"auth") => {
                let value = read_field(input, pos, USER_STOPS, 16, false);
                info.smtp_auth = match value.value.as_str() {
                    "login" => SmtpAuth::Login,
                    "plain" => SmtpAuth::Plain,
                    _ => {
                        info.errors |= UrlError::UNKNOWN_SMTP_AUTH;
                        SmtpAuth::None
                    }
                };
                stop = value.stop;
            }
            Some(b"user") => {
                let value = read_field(input, pos, USER_STOPS, MAX_SMTP_USER_LENGTH, false);
                if value.too_long {
                    info.errors |= UrlError::SMTP_USER_TOO_LONG;
                }
                info.smtp_user = value.value;
                stop = value.stop;
            }
            Some(b"fingerprint") => {
                let value = read_field(input, pos, USER_STOPS, 16 + MAX_FINGERPRINT_LENGTH, false);
                let (key_type, fingerprint) = KeyType::split_prefix(&value.value);
                if fingerprint.len() > MAX_FINGERPRINT_LENGTH || value.too_long {
                    info.errors |= UrlError::FINGERPRINT_TOO_LONG;
                }
                info.fingerprint = fingerprint.chars().take(MAX_FINGERPRINT_LENGTH).collect();
                info.key_type = Some(key_type.unwrap_or(KeyType::SshRsa));
                stop = value.stop;
            }
            _ => {
                info.errors |= UrlError::ONLY_FINGERPRINT_KNOWN;
                skip_to(input, pos, USER_STOPS);
                stop = input.get(*pos).copied();
            }
        }
    }
    if stop == Some(b':') {
        *pos += 1;
        let password = read_field(input, pos, b"@", MAX_PASSWORD_LENGTH, false);
        if password.too_long {
            info.errors |= UrlError::PASSWORD_TOO_LONG;
        }
        info.password = Some(password.value);
        stop = password.stop;
    }
    if stop == Some(b'@') {
        *pos += 1;
        Some(info)
    } else {
        None
    }
}

fn starts_with_ignore_case(input: &[u8], pos: usize, prefix: &[u8]) -> bool {
    input.len() >= pos + prefix.len() && input[pos..pos + prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Reads a `<alias>` or `%3Calias%3E` host reference; `None` if the host is not one.
fn read_alias(input: &[u8], pos: &mut usize) -> Option<String> {
    let (open, close): (&[u8], &[u8]) = if starts_with_ignore_case(input, *pos, b"<") {
        (b"<", b">")
    } else if starts_with_ignore_case(input, *pos, b"%3C") {
        (b"%3C", b"%3E")
    } else {
        return None;
    };
    let start = *pos + open.len();
    let mut end = start;
    while end < input.len() && !starts_with_ignore_case(input, end, close) {
        end += 1;
    }
    if end >= input.len() {
        return None;
    }
    *pos = end + close.len();
    Some(String::from_utf8_lossy(&input[start..end]).into_owned())
}

/// Byte offsets of interesting places in the original input.
pub(super) struct Layout {
    /// position of the `@` that ends the userinfo
    pub at: Option<usize>,
}

pub(super) fn parse_raw(url: &str, options: &ParseOptions) -> (UrlParts, UrlError, Layout) {
    let mut parts = UrlParts::default();
    let mut errors = UrlError::empty();
    let mut layout = Layout { at: None };
    let Some(separator) = url.find("://") else {
        return (parts, UrlError::NOT_A_URL, layout);
    };
    parts.scheme_name = url[..separator].to_string();
    parts.scheme = Scheme::from_name(&parts.scheme_name);
    if parts.scheme.is_none() {
        errors |= UrlError::UNKNOWN_SCHEME;
    }
    let input = url.as_bytes();
    let after_scheme = separator + 3;
    let mut pos = after_scheme;
    match read_userinfo(input, &mut pos) {
        Some(info) => {
            layout.at = Some(pos - 1);
            errors |= info.errors;
            parts.user = info.user;
            parts.smtp_auth = info.smtp_auth;
            parts.smtp_user = info.smtp_user;
            parts.key_type = info.key_type;
            parts.fingerprint = info.fingerprint;
            parts.password = info.password;
        }
        None => pos = after_scheme,
    }
    // host
    let alias_start = pos;
    match read_alias(input, &mut pos) {
        Some(alias) => {
            let resolved = options.aliases.and_then(|resolver| resolver.resolve(&alias));
            parts.host = match resolved {
                Some(host) => host,
                None => url[alias_start..pos].to_string(),
            };
            if parts.host.len() > MAX_HOST_LENGTH {
                errors |= UrlError::HOST_TOO_LONG;
            }
        }
        None => {
            let host = read_field(input, &mut pos, b":/;", MAX_HOST_LENGTH, true);
            if host.too_long {
                errors |= UrlError::HOST_TOO_LONG;
            }
            parts.host = host.value;
        }
    }
    if parts.host.is_empty() && !parts.scheme.is_some_and(Scheme::is_local) {
        errors |= UrlError::NO_HOST;
    }
    // port
    if input.get(pos) == Some(&b':') {
        pos += 1;
        let start = pos;
        skip_to(input, &mut pos, b"/;");
        let digits = &url[start..pos];
        if digits.len() > MAX_PORT_DIGITS {
            errors |= UrlError::PORT_TOO_LONG;
        } else {
            match digits.parse::<u16>() {
                Ok(port) if digits.bytes().all(|c| c.is_ascii_digit()) => parts.port = Some(port),
                _ => errors |= UrlError::PORT_INVALID,
            }
        }
    }
    // path
    if input.get(pos) == Some(&b'/') {
        pos += 1;
        let path = read_field(input, &mut pos, b";", MAX_PATH_LENGTH, true);
        if path.too_long {
            errors |= UrlError::PATH_TOO_LONG;
        }
        match timefmt::expand(&path.value, options.time) {
            Ok(expanded) => parts.path = expanded,
            Err(token_errors) => {
                errors |= token_errors;
                parts.path = path.value;
            }
        }
    }
    // trailing parameters
    while input.get(pos) == Some(&b';') {
        pos += 1;
        let keyword = read_keyword(input, &mut pos, b";");
        match keyword {
            Some(b"type") => {
                let value = read_field(input, &mut pos, b";", 8, false);
                match value.value.as_bytes() {
                    [c @ (b'a' | b'i' | b'd' | b'n' | b'f')] => parts.transfer_type = Some(*c as char),
                    _ => errors |= UrlError::UNKNOWN_TRANSFER_TYPE,
                }
            }
            Some(b"server") => {
                let value = read_field(input, &mut pos, b";", MAX_SERVER_LENGTH, true);
                if value.too_long {
                    errors |= UrlError::SERVER_TOO_LONG;
                }
                parts.server = value.value;
            }
            Some(b"protocol") => {
                let value = read_field(input, &mut pos, b";", 16, false);
                match value.value.parse::<u32>() {
                    Ok(version) => parts.protocol_version = Some(version),
                    Err(_) => errors |= UrlError::PROTOCOL_VERSION_INVALID,
                }
            }
            _ => {
                errors |= UrlError::UNKNOWN_PARAMETER;
                skip_to(input, &mut pos, b";");
            }
        }
    }
    (parts, errors, layout)
}
