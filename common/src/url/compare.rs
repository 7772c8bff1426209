use super::parse::{ParseOptions, parse_raw};
use super::{UrlError, UrlParts};

bitmask! {
    /// Fields in which two URLs differ
    pub struct UrlDiff: u16 {
        const SCHEME = 1 << 0;
        const PORT = 1 << 1;
        const TRANSFER_TYPE = 1 << 2;
        const PROTOCOL_VERSION = 1 << 3;
        const SMTP_AUTH = 1 << 4;
        const USER = 1 << 5;
        const SMTP_USER = 1 << 6;
        const PASSWORD = 1 << 7;
        const HOST = 1 << 8;
        const PATH = 1 << 9;
        const SERVER = 1 << 10;
        const KEY_TYPE = 1 << 11;
        const FINGERPRINT = 1 << 12;
        /// one of the URLs could not be parsed, no other bit is meaningful
        const UNPARSABLE = 1 << 15;
    }
}

/// Looks up stored passwords by `user@host`.
pub trait PasswordStore {
    fn lookup(&self, key: &str) -> Option<String>;
}

impl PasswordStore for std::collections::HashMap<String, String> {
    fn lookup(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Errors a URL may carry and still be compared or rewritten.
const TOLERATED: UrlError = UrlError::UNKNOWN_SCHEME;

fn diff_parts(a: &UrlParts, b: &UrlParts) -> UrlDiff {
    let mut diff = UrlDiff::empty();
    let mut mark = |differs: bool, flag: UrlDiff| {
        if differs {
            diff |= flag;
        }
    };
    mark(!a.scheme_name.eq_ignore_ascii_case(&b.scheme_name), UrlDiff::SCHEME);
    mark(a.port != b.port, UrlDiff::PORT);
    mark(a.transfer_type != b.transfer_type, UrlDiff::TRANSFER_TYPE);
    mark(a.protocol_version != b.protocol_version, UrlDiff::PROTOCOL_VERSION);
    mark(a.smtp_auth != b.smtp_auth, UrlDiff::SMTP_AUTH);
    mark(a.user != b.user, UrlDiff::USER);
    mark(a.smtp_user != b.smtp_user, UrlDiff::SMTP_USER);
    mark(a.password != b.password, UrlDiff::PASSWORD);
    mark(a.host != b.host, UrlDiff::HOST);
    mark(a.path != b.path, UrlDiff::PATH);
    mark(a.server != b.server, UrlDiff::SERVER);
    mark(a.key_type != b.key_type, UrlDiff::KEY_TYPE);
    mark(a.fingerprint != b.fingerprint, UrlDiff::FINGERPRINT);
    diff
}

/// Compares two URLs field by field.
///
/// Returns [`UrlDiff::UNPARSABLE`] alone if either URL has a defect other than an unknown scheme.
pub fn url_compare(a: &str, b: &str) -> UrlDiff {
    let options = ParseOptions::default();
    let (parts_a, errors_a, _) = parse_raw(a, &options);
    let (parts_b, errors_b, _) = parse_raw(b, &options);
    if !errors_a.without(TOLERATED).is_empty() || !errors_b.without(TOLERATED).is_empty() {
        return UrlDiff::UNPARSABLE;
    }
    diff_parts(&parts_a, &parts_b)
}

fn escape_password(password: &str) -> String {
    let mut escaped = String::with_capacity(password.len());
    for c in password.chars() {
        if matches!(c, '@' | ':' | ';' | '%' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Inserts a password into a URL that has a userinfo part but no password.
///
/// Without an explicit `password` the one stored under `user@host` is used. URLs that already
/// carry a password, have no userinfo, or have no known password come back unchanged.
pub fn url_insert_password(
    url: &str,
    password: Option<&str>,
    store: &dyn PasswordStore,
) -> Result<String, UrlError> {
    let (parts, errors, layout) = parse_raw(url, &ParseOptions::default());
    let fatal = errors.without(TOLERATED);
    if !fatal.is_empty() {
        return Err(fatal);
    }
    if parts.password.is_some() {
        return Ok(url.to_string());
    }
    let Some(at) = layout.at else {
        return Ok(url.to_string());
    };
    let password = match password {
        Some(password) => password.to_string(),
        None => match store.lookup(&parts.credential_key()) {
            Some(password) => password,
            None => return Ok(url.to_string()),
        },
    };
    Ok(format!(
        "{}:{}{}",
        &url[..at],
        escape_password(&password),
        &url[at..]
    ))
}
