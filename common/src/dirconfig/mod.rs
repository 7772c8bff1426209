//! Rule file compiler
//!
//! Rule files describe watched directories, the file groups inside them and where each group
//! goes. [`compile`] turns a set of rule files into three index-addressed tables:
//!
//! - [`DirectoryEntry`] per watched directory
//! - [`JobEntry`] per directory, file group, destination and recipient, grouped so that all
//!   jobs of one directory form one contiguous range
//! - [`HostEntry`] per distinct recipient host
//!
//! Malformed entries never fail a compile; they are dropped and reported as warnings.

mod checker;
mod compile;
pub mod cron;
pub mod scanner;
mod store;

pub use checker::{CheckedOption, DefaultOptionChecker, OptionChecker};
pub use compile::{compile, expand_tilde, normalize_path};
pub use cron::TimeSchedule;
pub use store::{StoreReport, StoredTable, load, store};

use crate::filter::FileFilter;
use crate::options::LocalOption;
use crate::url::{Protocols, Scheme, UrlParts};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PARALLEL_JOBS: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: u64 = 600;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const MAX_HOST_ALIAS_LENGTH: usize = 40;

/// Fatal compiler failures; everything else is a warning
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("none of the rule files could be read: {0:?}")]
    NoRuleFile(Vec<std::path::PathBuf>),
    #[error("failed to read rule file {path:?}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to store the job table at {path:?}")]
    Store {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("job table is inconsistent: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileWarning {
    pub file: std::path::PathBuf,
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.message)
    }
}

/// Per-directory settings from the `[dir options]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirOptions {
    /// files no job wants are deleted once older than this many seconds
    pub delete_unknown_files: Option<u64>,
    /// queued files of paused hosts are deleted once older than this many seconds
    pub delete_queued_files: Option<u64>,
    /// copy files instead of moving them, remembering what was already taken
    pub do_not_remove: bool,
    /// bound on concurrent workers for this directory
    pub max_process: usize,
    /// overrides the global files-per-chunk limit
    pub max_files: Option<usize>,
    /// overrides the global bytes-per-chunk limit
    pub max_size: Option<u64>,
    /// warn when nothing arrived for this many seconds, 0 disables
    pub warn_time: u64,
    /// scan on every check even when the modification time did not change
    pub force_reread: bool,
}

impl DirOptions {
    pub fn with_defaults(settings: &crate::CompileSettings) -> Self {
        Self {
            delete_unknown_files: (settings.default_delete_unknown > 0)
                .then_some(settings.default_delete_unknown),
            delete_queued_files: None,
            do_not_remove: false,
            max_process: settings.default_max_process,
            max_files: None,
            max_size: None,
            warn_time: settings.default_warn_time,
            force_reread: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Local(std::path::PathBuf),
    /// files are fetched by an external retriever into `spool`
    Remote {
        url: String,
        parts: UrlParts,
        spool: std::path::PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileGroup {
    pub name: String,
    pub filter: FileFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// stable hash of config id and normalized location
    pub id: u32,
    pub alias: String,
    pub location: Location,
    /// hash of the rule file the entry came from
    pub config_id: u32,
    pub file_groups: Vec<FileGroup>,
    pub options: DirOptions,
}

impl DirectoryEntry {
    /// Directory that is actually scanned for new files.
    pub fn scan_path(&self) -> &std::path::Path {
        match &self.location {
            Location::Local(path) => path,
            Location::Remote { spool, .. } => spool,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.location, Location::Remote { .. })
    }
}

/// A local option together with the line it was parsed from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfiguredOption {
    pub line: String,
    pub option: LocalOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    /// stable hash of directory, file group, recipient and options
    pub job_id: u32,
    /// `0` is the most urgent
    pub priority: u8,
    pub dir_index: usize,
    pub dir_id: u32,
    pub dir_alias: String,
    pub file_group: usize,
    pub filter: FileFilter,
    pub local_options: Vec<ConfiguredOption>,
    pub standard_options: Vec<String>,
    pub schedules: Vec<TimeSchedule>,
    pub recipient: String,
    pub url: UrlParts,
    pub scheme: Scheme,
    pub host_alias: String,
    pub host_index: usize,
    pub config_id: u32,
}

/// All jobs, contiguous per directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTable {
    jobs: Vec<JobEntry>,
    dir_ranges: Vec<std::ops::Range<usize>>,
}

impl JobTable {
    /// Groups jobs by directory and records each directory's range.
    ///
    /// The sort is stable so jobs of one directory keep their declaration order.
    pub fn new(mut jobs: Vec<JobEntry>, dir_count: usize) -> Self {
        jobs.sort_by_key(|job| job.dir_index);
        let mut dir_ranges = vec![0..0; dir_count];
        let mut start = 0;
        while start < jobs.len() {
            let dir_index = jobs[start].dir_index;
            let end = start
                + jobs[start..]
                    .iter()
                    .take_while(|job| job.dir_index == dir_index)
                    .count();
            if let Some(range) = dir_ranges.get_mut(dir_index) {
                *range = start..end;
            }
            start = end;
        }
        Self { jobs, dir_ranges }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&JobEntry> {
        self.jobs.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobEntry> {
        self.jobs.iter()
    }

    /// Index range of the jobs of one directory.
    pub fn dir_range(&self, dir_index: usize) -> std::ops::Range<usize> {
        self.dir_ranges.get(dir_index).cloned().unwrap_or(0..0)
    }

    pub fn dir_jobs(&self, dir_index: usize) -> &[JobEntry] {
        &self.jobs[self.dir_range(dir_index)]
    }

    pub fn find(&self, job_id: u32) -> Option<usize> {
        self.jobs.iter().position(|job| job.job_id == job_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub alias: String,
    pub hostname: String,
    pub protocols: Protocols,
    pub parallel_jobs: u32,
    pub retry_interval: u64,
    pub block_size: u32,
    /// referenced by at least one recipient in the latest compile
    pub seen: bool,
}

impl HostEntry {
    fn new(alias: &str, hostname: &str, protocols: Protocols) -> Self {
        Self {
            alias: alias.to_string(),
            hostname: hostname.to_string(),
            protocols,
            parallel_jobs: DEFAULT_PARALLEL_JOBS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            block_size: DEFAULT_BLOCK_SIZE,
            seen: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTable {
    hosts: Vec<HostEntry>,
}

impl HostTable {
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HostEntry> {
        self.hosts.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostEntry> {
        self.hosts.iter()
    }

    pub fn find(&self, alias: &str) -> Option<usize> {
        self.hosts.iter().position(|host| host.alias == alias)
    }

    /// Adds a host or merges into the existing entry with the same alias.
    ///
    /// A known alias keeps its data; only the protocol set grows.
    pub fn register(&mut self, alias: &str, hostname: &str, protocols: Protocols) -> usize {
        match self.find(alias) {
            Some(index) => {
                let host = &mut self.hosts[index];
                host.protocols |= protocols;
                host.seen = true;
                index
            }
            None => {
                self.hosts.push(HostEntry::new(alias, hostname, protocols));
                self.hosts.len() - 1
            }
        }
    }

    fn mark_unseen(&mut self) {
        for host in &mut self.hosts {
            host.seen = false;
        }
    }

    fn remove_unseen(&mut self) -> usize {
        let before = self.hosts.len();
        self.hosts.retain(|host| host.seen);
        before - self.hosts.len()
    }
}

impl crate::url::AliasResolver for HostTable {
    fn resolve(&self, alias: &str) -> Option<String> {
        self.find(alias).map(|index| self.hosts[index].hostname.clone())
    }
}

/// Host alias of a recipient: its host name, or `localhost` for local schemes.
pub fn host_alias(parts: &UrlParts) -> String {
    if parts.host.is_empty() {
        return "localhost".to_string();
    }
    parts
        .host
        .to_ascii_lowercase()
        .chars()
        .take(MAX_HOST_ALIAS_LENGTH)
        .collect()
}

/// Output of one compile run
#[derive(Debug, Clone, Default)]
pub struct Compiled {
    pub directories: Vec<DirectoryEntry>,
    pub jobs: JobTable,
    pub hosts: HostTable,
    pub warnings: Vec<CompileWarning>,
}

impl Compiled {
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// Checks that every job points at the directory and host it names.
    pub fn validate(&self) -> Result<(), CompileError> {
        for (index, job) in self.jobs.iter().enumerate() {
            let Some(dir) = self.directories.get(job.dir_index) else {
                return Err(CompileError::Inconsistent(format!(
                    "job {} ({:08x}) points at missing directory {}",
                    index, job.job_id, job.dir_index
                )));
            };
            if dir.id != job.dir_id {
                return Err(CompileError::Inconsistent(format!(
                    "job {:08x} expects directory {:08x} at index {} but found {:08x}",
                    job.job_id, job.dir_id, job.dir_index, dir.id
                )));
            }
            if !self.jobs.dir_range(job.dir_index).contains(&index) {
                return Err(CompileError::Inconsistent(format!(
                    "job {:08x} lies outside the range of directory {}",
                    job.job_id, dir.alias
                )));
            }
            match self.hosts.get(job.host_index) {
                Some(host) if host.alias == job.host_alias => {}
                _ => {
                    return Err(CompileError::Inconsistent(format!(
                        "job {:08x} host {} does not resolve at index {}",
                        job.job_id, job.host_alias, job.host_index
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_register_merges_protocols_only() {
        let mut hosts = HostTable::default();
        let a = hosts.register("h", "h.example.com", Protocols::FTP);
        let b = hosts.register("h", "other.example.com", Protocols::SFTP);
        assert_eq!(a, b);
        assert_eq!(hosts.len(), 1);
        let host = hosts.get(a).unwrap();
        assert_eq!(host.hostname, "h.example.com");
        assert_eq!(host.protocols, Protocols::FTP | Protocols::SFTP);
        assert_eq!(host.parallel_jobs, DEFAULT_PARALLEL_JOBS);
    }

    #[test]
    fn unseen_hosts_are_pruned() {
        let mut hosts = HostTable::default();
        hosts.register("old", "old", Protocols::FTP);
        hosts.mark_unseen();
        hosts.register("new", "new", Protocols::FTP);
        assert_eq!(hosts.remove_unseen(), 1);
        assert_eq!(hosts.find("new"), Some(0));
        assert_eq!(hosts.find("old"), None);
    }
}
