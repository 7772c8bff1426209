//! Named rename rules
//!
//! The rule file holds `[name]` headers, each followed by `filter target` lines:
//!
//! ```text
//! [daily]
//! report_*   out_*
//! !*.tmp
//! *.log
//! ```
//!
//! The first line whose filter matches decides. A negated filter (`!`) keeps the name; a line
//! without a target empties the name, which drops the file.

use anyhow::{Context, Result};

use super::template::{Captures, Wildcard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameLine {
    filter: Wildcard,
    negated: bool,
    target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameRule {
    lines: Vec<RenameLine>,
}

/// Outcome of looking up one file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch<'a> {
    Keep,
    Rename { target: &'a str, captures: Captures },
}

impl RenameRule {
    pub fn lookup(&self, name: &str) -> RuleMatch<'_> {
        for line in &self.lines {
            if let Some(captures) = line.filter.captures(name) {
                if line.negated {
                    return RuleMatch::Keep;
                }
                return RuleMatch::Rename {
                    target: &line.target,
                    captures,
                };
            }
        }
        RuleMatch::Keep
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameRules {
    rules: std::collections::HashMap<String, RenameRule>,
}

impl RenameRules {
    pub fn parse(content: &str) -> Self {
        let mut rules: std::collections::HashMap<String, RenameRule> = Default::default();
        let mut current: Option<String> = None;
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                let name = name.trim().to_string();
                if rules.contains_key(&name) {
                    tracing::warn!("rename rule [{}] defined twice, lines are appended", name);
                }
                rules.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some(rule) = current.as_ref().and_then(|name| rules.get_mut(name)) else {
                tracing::warn!("rename rule line {} outside of a [rule] section", idx + 1);
                continue;
            };
            let mut words = line.split_whitespace();
            let filter = words.next().unwrap_or_default();
            let target = words.next().unwrap_or_default().to_string();
            if words.next().is_some() {
                tracing::warn!("rename rule line {}: extra words ignored", idx + 1);
            }
            let (negated, filter) = match filter.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, filter),
            };
            rule.lines.push(RenameLine {
                filter: Wildcard::new(filter),
                negated,
                target,
            });
        }
        Self { rules }
    }

    /// Reads the rule file; a missing file yields an empty set.
    pub async fn load(path: &std::path::Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let rules = Self::parse(&content);
                tracing::info!("loaded {} rename rules from {:?}", rules.len(), path);
                Ok(rules)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no rename rule file at {:?}", path);
                Ok(Self::default())
            }
            Err(error) => {
                Err(error).with_context(|| format!("failed to read rename rules {:?}", path))
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&RenameRule> {
        self.rules.get(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
