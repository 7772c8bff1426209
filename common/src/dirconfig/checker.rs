use super::cron::TimeSchedule;
use crate::options::LocalOption;

/// What an accepted destination option line turned out to be
#[derive(Clone, Debug, PartialEq)]
pub enum CheckedOption {
    /// handled by the option pipeline before hand-off
    Local(LocalOption),
    /// job priority, also passed on to the transfer layer
    Priority(u8),
    /// files are held and sent at the scheduled times
    Time(TimeSchedule),
    /// passed through to the transfer layer untouched
    Standard(String),
}

/// Validates one destination option line.
///
/// The compiler drops lines the checker rejects and keeps compiling.
pub trait OptionChecker: Send + Sync {
    fn check(&self, line: &str) -> Result<CheckedOption, String>;
}

/// Options the transfer layer understands; they are checked by name only.
const STANDARD_OPTIONS: &[&str] = &[
    "active",
    "age-limit",
    "archive",
    "attach all files",
    "attach file",
    "charset",
    "chmod",
    "chown",
    "create target dir",
    "do not create target dir",
    "dupcheck",
    "file name is subject",
    "file name is user",
    "from",
    "keep time stamp",
    "lock",
    "lockp",
    "match size",
    "mirror source",
    "no login",
    "passive",
    "reply-to",
    "restart",
    "sequence locking",
    "socket send buffer",
    "sort file names",
    "subject",
    "timeout",
    "trans_rename",
    "ulock",
];

/// Checker accepting the option set of this workspace
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOptionChecker;

impl OptionChecker for DefaultOptionChecker {
    fn check(&self, line: &str) -> Result<CheckedOption, String> {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("priority") {
            let rest = rest.trim();
            return match rest.as_bytes() {
                [digit @ b'0'..=b'9'] => Ok(CheckedOption::Priority(digit - b'0')),
                _ => Err(format!("priority must be a single digit, not '{}'", rest)),
            };
        }
        if let Some(rest) = line.strip_prefix("time ") {
            return TimeSchedule::parse(rest).map(CheckedOption::Time);
        }
        if let Some(option) = LocalOption::parse(line)? {
            return Ok(CheckedOption::Local(option));
        }
        let known = STANDARD_OPTIONS.iter().any(|name| {
            line.strip_prefix(name)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
        });
        if known {
            Ok(CheckedOption::Standard(line.to_string()))
        } else {
            Err(format!("unknown option '{}'", line))
        }
    }
}
