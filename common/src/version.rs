// version information stamped into stored job tables

use serde::{Deserialize, Serialize};

/// Layout version of the stored job table; bump when [`crate::dirconfig::StoredTable`] changes.
pub const TABLE_FORMAT: u32 = 1;

/// Build version written next to every stored job table
///
/// A reader accepts a table only if the format matches; the program version is carried for
/// diagnosing which build wrote a table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildVersion {
    /// Layout of the stored data
    pub format: u32,

    /// Semantic version from Cargo.toml (e.g., "0.1.0")
    pub semantic: String,

    /// Git describe output (e.g., "v0.1.0-7-g644da27"), absent for builds outside git
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_describe: Option<String>,
}

impl BuildVersion {
    /// Version of the running binary, from environment variables set by build.rs
    pub fn current() -> Self {
        Self {
            format: TABLE_FORMAT,
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("FDIST_GIT_DESCRIBE").map(String::from),
        }
    }

    /// Tables are exchangeable between builds with the same layout version
    ///
    /// ```
    /// use common::version::BuildVersion;
    ///
    /// let ours = BuildVersion::current();
    /// let older = BuildVersion {
    ///     semantic: "0.0.9".to_string(),
    ///     git_describe: None,
    ///     ..ours.clone()
    /// };
    /// assert!(ours.is_compatible_with(&older));
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.format == other.format
    }

    /// Human-readable version, with git describe information when available
    pub fn display(&self) -> String {
        if let Some(ref git_describe) = self.git_describe {
            format!("{} ({})", self.semantic, git_describe)
        } else {
            self.semantic.clone()
        }
    }
}

impl std::fmt::Display for BuildVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_version() {
        let version = BuildVersion::current();
        assert!(!version.semantic.is_empty());
        assert_eq!(version.format, TABLE_FORMAT);
    }

    #[test]
    fn test_format_decides_compatibility() {
        let v1 = BuildVersion {
            format: 1,
            semantic: "0.1.0".to_string(),
            git_describe: None,
        };
        let v2 = BuildVersion {
            format: 2,
            ..v1.clone()
        };
        assert!(!v1.is_compatible_with(&v2));
        assert!(!v2.is_compatible_with(&v1));
    }

    #[test]
    fn test_display() {
        let mut v = BuildVersion {
            format: 1,
            semantic: "0.1.0".to_string(),
            git_describe: None,
        };
        assert_eq!(v.display(), "0.1.0");
        v.git_describe = Some("v0.1.0-7-g644da27".to_string());
        assert_eq!(v.to_string(), "0.1.0 (v0.1.0-7-g644da27)");
    }

    #[test]
    fn test_json_without_git() {
        let v: BuildVersion = serde_json::from_str(r#"{"format":1,"semantic":"0.1.0"}"#).unwrap();
        assert!(v.git_describe.is_none());
    }
}
