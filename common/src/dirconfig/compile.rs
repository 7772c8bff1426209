use std::collections::{HashMap, HashSet};
use std::os::unix::fs::DirBuilderExt;

use super::checker::{CheckedOption, OptionChecker};
use super::scanner::{self, RawDestination, RawDirectory};
use super::{
    CompileError, CompileWarning, Compiled, ConfiguredOption, DirOptions, DirectoryEntry,
    FileGroup, HostTable, JobEntry, JobTable, Location, TimeSchedule, host_alias,
};
use crate::CompileSettings;
use crate::filter::{FileFilter, FilterPattern};
use crate::url::{self, Scheme, UrlParts};

/// Lexically normalizes a path: collapses `.`, `..` and repeated `/`, strips a trailing `/`.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Expands `~` and `~user` at the start of a path; `None` if the user is unknown.
pub fn expand_tilde(path: &str) -> Option<String> {
    let Some(rest) = path.strip_prefix('~') else {
        return Some(path.to_string());
    };
    let (user, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let home = if user.is_empty() {
        match std::env::var_os("HOME") {
            Some(home) => std::path::PathBuf::from(home),
            None => nix::unistd::User::from_uid(nix::unistd::getuid()).ok()??.dir,
        }
    } else {
        nix::unistd::User::from_name(user).ok()??.dir
    };
    Some(format!("{}{}", home.display(), tail))
}

struct Warnings<'a> {
    file: &'a std::path::Path,
    list: &'a mut Vec<CompileWarning>,
}

impl Warnings<'_> {
    fn add(&mut self, line: usize, message: impl Into<String>) {
        let warning = CompileWarning {
            file: self.file.to_path_buf(),
            line,
            message: message.into(),
        };
        tracing::warn!("{}", warning);
        self.list.push(warning);
    }
}

struct DraftJob {
    group: usize,
    /// of the `[destination]` marker
    line: usize,
    priority: u8,
    filter: FileFilter,
    local_options: Vec<ConfiguredOption>,
    standard_options: Vec<String>,
    schedules: Vec<TimeSchedule>,
    recipient: String,
    url: UrlParts,
    scheme: Scheme,
    /// feeds the job id
    identity: Vec<u8>,
}

struct DraftDirectory {
    key: String,
    line: usize,
    file: std::path::PathBuf,
    entry: DirectoryEntry,
    alias_given: bool,
    jobs: Vec<DraftJob>,
}

fn parse_number<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", value.trim()))
}

fn apply_dir_option(options: &mut DirOptions, line: &str) -> Result<(), String> {
    const HOUR: u64 = 3600;
    if let Some(rest) = line.strip_prefix("delete unknown files") {
        options.delete_unknown_files = Some(parse_number::<u64>(rest)? * HOUR);
    } else if let Some(rest) = line.strip_prefix("delete queued files") {
        options.delete_queued_files = Some(parse_number::<u64>(rest)? * HOUR);
    } else if line == "do not remove" {
        options.do_not_remove = true;
    } else if let Some(rest) = line.strip_prefix("max process") {
        let max = parse_number::<usize>(rest)?;
        if max == 0 {
            return Err("max process must be at least 1".to_string());
        }
        options.max_process = max;
    } else if let Some(rest) = line.strip_prefix("max files") {
        options.max_files = Some(parse_number(rest)?);
    } else if let Some(rest) = line.strip_prefix("max size") {
        let size: bytesize::ByteSize = rest
            .trim()
            .parse()
            .map_err(|error| format!("invalid size '{}': {}", rest.trim(), error))?;
        options.max_size = Some(size.as_u64());
    } else if let Some(rest) = line.strip_prefix("warn time") {
        options.warn_time = parse_number(rest)?;
    } else if line == "force reread" {
        options.force_reread = true;
    } else if line == "ignore dot files" {
        // dot files are always ignored
    } else {
        return Err(format!("unknown directory option '{}'", line));
    }
    Ok(())
}

/// Resolves the header token into a location and the key used for de-duplication.
fn resolve_location(
    raw: &str,
    settings: &CompileSettings,
    config_id: u32,
) -> Result<(Location, String, u32), String> {
    if raw.contains("://") {
        let parts = url::parse(raw).map_err(|error| format!("invalid URL '{}': {}", raw, error))?;
        if parts.scheme.is_some_and(Scheme::is_local) {
            let path = normalize_path(&parts.local_path().to_string_lossy());
            let id = directory_id(config_id, &path);
            return Ok((Location::Local(path.clone().into()), path, id));
        }
        let key = parts.to_url(false);
        let id = directory_id(config_id, &key);
        let spool = settings.spool_root.join(format!("{:08x}", id));
        return Ok((
            Location::Remote {
                url: raw.to_string(),
                parts,
                spool,
            },
            key,
            id,
        ));
    }
    let unescaped = scanner::unescape(raw);
    let expanded =
        expand_tilde(&unescaped).ok_or_else(|| format!("cannot expand '{}'", unescaped))?;
    if !expanded.starts_with('/') {
        return Err(format!("directory '{}' is not an absolute path", expanded));
    }
    let path = normalize_path(&expanded);
    let id = directory_id(config_id, &path);
    Ok((Location::Local(path.clone().into()), path, id))
}

fn directory_id(config_id: u32, key: &str) -> u32 {
    let mut bytes = config_id.to_le_bytes().to_vec();
    bytes.extend_from_slice(key.as_bytes());
    xxhash_rust::xxh32::xxh32(&bytes, 0)
}

fn default_alias(location: &Location) -> String {
    let last_component = |path: &str| {
        path.rsplit('/')
            .find(|component| !component.is_empty())
            .map(str::to_string)
    };
    match location {
        Location::Local(path) => last_component(&path.to_string_lossy()),
        Location::Remote { parts, .. } => last_component(&parts.path).or(Some(parts.host.clone())),
    }
    .unwrap_or_else(|| "root".to_string())
}

/// Turns one destination into draft jobs; drops broken recipients and options.
fn compile_destination(
    dest: &RawDestination,
    group: usize,
    filter: &FileFilter,
    settings: &CompileSettings,
    checker: &dyn OptionChecker,
    warnings: &mut Warnings,
) -> Vec<DraftJob> {
    let mut priority = settings.default_priority;
    let mut local_options = Vec::new();
    let mut standard_options = Vec::new();
    let mut schedules = Vec::new();
    for line in &dest.options {
        match checker.check(&line.text) {
            Ok(CheckedOption::Local(option)) => local_options.push(ConfiguredOption {
                line: line.text.clone(),
                option,
            }),
            Ok(CheckedOption::Priority(value)) => {
                priority = value;
                standard_options.push(line.text.clone());
            }
            Ok(CheckedOption::Time(schedule)) => {
                schedules.push(schedule);
                standard_options.push(line.text.clone());
            }
            Ok(CheckedOption::Standard(text)) => standard_options.push(text),
            Err(reason) => warnings.add(line.number, format!("option dropped: {}", reason)),
        }
    }
    let mut jobs = Vec::new();
    for line in &dest.recipients {
        let parts = match url::parse(&line.text) {
            Ok(parts) => parts,
            Err(error) => {
                warnings.add(
                    line.number,
                    format!("recipient '{}' dropped: {}", redact(&line.text), error),
                );
                continue;
            }
        };
        let Some(scheme) = parts.scheme else {
            continue;
        };
        let mut identity = Vec::new();
        for piece in filter
            .originals()
            .chain([line.text.as_str()])
            .chain(dest.options.iter().map(|l| l.text.as_str()))
        {
            identity.extend_from_slice(piece.as_bytes());
            identity.push(0);
        }
        jobs.push(DraftJob {
            group,
            line: dest.line,
            priority,
            filter: filter.clone(),
            local_options: local_options.clone(),
            standard_options: standard_options.clone(),
            schedules: schedules.clone(),
            recipient: line.text.clone(),
            url: parts,
            scheme,
            identity,
        });
    }
    if jobs.is_empty() {
        warnings.add(dest.line, "destination has no valid recipient");
    }
    jobs
}

/// Hides a password for log output when the recipient parses far enough.
fn redact(recipient: &str) -> String {
    let (parts, _) = url::parse_lenient(recipient);
    if parts.password.is_some() {
        parts.to_url(false)
    } else {
        recipient.to_string()
    }
}

fn compile_directory(
    raw: &RawDirectory,
    config_id: u32,
    settings: &CompileSettings,
    checker: &dyn OptionChecker,
    warnings: &mut Warnings,
) -> Option<DraftDirectory> {
    let (location, key, id) = match resolve_location(&raw.location, settings, config_id) {
        Ok(resolved) => resolved,
        Err(reason) => {
            warnings.add(raw.line, format!("directory dropped: {}", reason));
            return None;
        }
    };
    let mut options = DirOptions::with_defaults(settings);
    for line in &raw.options {
        if let Err(reason) = apply_dir_option(&mut options, &line.text) {
            warnings.add(line.number, reason);
        }
    }
    let mut file_groups = Vec::new();
    let mut jobs = Vec::new();
    for raw_group in &raw.groups {
        let mut patterns = Vec::new();
        for line in &raw_group.filters {
            match FilterPattern::parse(&line.text) {
                Ok(_) => patterns.push(line.text.clone()),
                Err(error) => warnings.add(line.number, format!("filter dropped: {:#}", error)),
            }
        }
        let filter = match FileFilter::from_patterns(&patterns) {
            Ok(filter) => filter,
            Err(error) => {
                warnings.add(raw_group.line, format!("file group dropped: {:#}", error));
                continue;
            }
        };
        let group_index = file_groups.len();
        for dest in &raw_group.destinations {
            jobs.extend(compile_destination(
                dest,
                group_index,
                &filter,
                settings,
                checker,
                warnings,
            ));
        }
        file_groups.push(FileGroup {
            name: raw_group.name.clone(),
            filter,
        });
    }
    let alias = raw.alias.clone().unwrap_or_else(|| default_alias(&location));
    Some(DraftDirectory {
        key,
        line: raw.line,
        file: warnings.file.to_path_buf(),
        alias_given: raw.alias.is_some(),
        entry: DirectoryEntry {
            id,
            alias,
            location,
            config_id,
            file_groups,
            options,
        },
        jobs,
    })
}

/// Makes sure a scanned directory exists, creating it when allowed.
fn ensure_directory(path: &std::path::Path, settings: &CompileSettings) -> Result<(), String> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(format!("{:?} exists but is not a directory", path)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            if !settings.create_source_dir {
                return Err(format!("{:?} does not exist", path));
            }
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(settings.source_dir_mode)
                .create(path)
                .map_err(|error| format!("failed to create {:?}: {}", path, error))?;
            tracing::info!("created directory {:?}", path);
            Ok(())
        }
        Err(error) => Err(format!("cannot access {:?}: {}", path, error)),
    }
}

/// Compiles rule files into directory, job and host tables.
///
/// `previous_hosts` carries the host table of the last successful compile; its entries survive
/// unless `remove_unused_hosts` is set and no recipient references them anymore.
pub fn compile(
    rule_files: &[std::path::PathBuf],
    settings: &CompileSettings,
    checker: &dyn OptionChecker,
    previous_hosts: Option<&HostTable>,
) -> Result<Compiled, CompileError> {
    let mut warning_list = Vec::new();
    let mut drafts: Vec<DraftDirectory> = Vec::new();
    let mut by_key: HashMap<(u32, String), usize> = HashMap::new();
    let mut files_read = 0;
    for rule_file in rule_files {
        let content = match std::fs::read_to_string(rule_file) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("rule file {:?} does not exist", rule_file);
                warning_list.push(CompileWarning {
                    file: rule_file.clone(),
                    line: 0,
                    message: "rule file does not exist".to_string(),
                });
                continue;
            }
            Err(source) => {
                return Err(CompileError::Read {
                    path: rule_file.clone(),
                    source,
                });
            }
        };
        files_read += 1;
        let config_id = xxhash_rust::xxh32::xxh32(rule_file.to_string_lossy().as_bytes(), 0);
        let mut warnings = Warnings {
            file: rule_file,
            list: &mut warning_list,
        };
        let (raw_dirs, scan_warnings) = scanner::scan(&content);
        for warning in scan_warnings {
            warnings.add(warning.line, warning.message);
        }
        for raw in &raw_dirs {
            let Some(draft) = compile_directory(raw, config_id, settings, checker, &mut warnings)
            else {
                continue;
            };
            match by_key.get(&(config_id, draft.key.clone())) {
                Some(&existing) => {
                    // merge into the first occurrence
                    let target = &mut drafts[existing];
                    let offset = target.entry.file_groups.len();
                    target.entry.file_groups.extend(draft.entry.file_groups);
                    target.jobs.extend(draft.jobs.into_iter().map(|mut job| {
                        job.group += offset;
                        job
                    }));
                    tracing::debug!(
                        "merged duplicate directory {} (line {}) into line {}",
                        draft.key,
                        draft.line,
                        target.line
                    );
                }
                None => {
                    by_key.insert((config_id, draft.key.clone()), drafts.len());
                    drafts.push(draft);
                }
            }
        }
    }
    if files_read == 0 {
        return Err(CompileError::NoRuleFile(rule_files.to_vec()));
    }
    // drop what cannot work, then settle aliases
    let mut used_aliases = HashSet::new();
    let mut directories = Vec::new();
    let mut dir_files = Vec::new();
    let mut draft_jobs = Vec::new();
    for mut draft in drafts {
        let mut warnings = Warnings {
            file: &draft.file,
            list: &mut warning_list,
        };
        if draft.jobs.is_empty() {
            warnings.add(
                draft.line,
                format!("directory {} dropped: no valid destination", draft.key),
            );
            continue;
        }
        if let Err(reason) = ensure_directory(draft.entry.scan_path(), settings) {
            warnings.add(draft.line, format!("directory dropped: {}", reason));
            continue;
        }
        if !used_aliases.insert(draft.entry.alias.clone()) {
            let replacement = format!("{:08x}", draft.entry.id);
            warnings.add(
                draft.line,
                format!(
                    "duplicate {}alias '{}' replaced by '{}'",
                    if draft.alias_given { "" } else { "default " },
                    draft.entry.alias,
                    replacement
                ),
            );
            draft.entry.alias = replacement;
            used_aliases.insert(draft.entry.alias.clone());
        }
        let dir_index = directories.len();
        draft_jobs.extend(draft.jobs.into_iter().map(|job| (dir_index, job)));
        directories.push(draft.entry);
        dir_files.push(draft.file);
    }
    // hosts
    let mut hosts = previous_hosts.cloned().unwrap_or_default();
    hosts.mark_unseen();
    for (_, job) in &draft_jobs {
        let alias = host_alias(&job.url);
        let hostname = if job.url.host.is_empty() {
            "localhost"
        } else {
            job.url.host.as_str()
        };
        hosts.register(&alias, hostname, job.scheme.protocol());
    }
    if settings.remove_unused_hosts {
        let removed = hosts.remove_unseen();
        if removed > 0 {
            tracing::info!("removed {} unused hosts", removed);
        }
    }
    let mut jobs = Vec::with_capacity(draft_jobs.len());
    let mut job_ids = HashSet::new();
    for (dir_index, draft) in draft_jobs {
        let dir: &DirectoryEntry = &directories[dir_index];
        let alias = host_alias(&draft.url);
        let host_index = hosts.find(&alias).ok_or_else(|| {
            CompileError::Inconsistent(format!("host {} vanished during compile", alias))
        })?;
        let mut identity = dir.id.to_le_bytes().to_vec();
        identity.extend_from_slice(&draft.identity);
        let mut job_id = xxhash_rust::xxh32::xxh32(&identity, 0);
        // job ids name the holding areas, a repeated destination needs its own
        let mut occurrence = 0u32;
        while !job_ids.insert(job_id) {
            occurrence += 1;
            identity.extend_from_slice(&occurrence.to_le_bytes());
            job_id = xxhash_rust::xxh32::xxh32(&identity, 0);
        }
        if occurrence > 0 {
            let mut warnings = Warnings {
                file: &dir_files[dir_index],
                list: &mut warning_list,
            };
            warnings.add(
                draft.line,
                format!(
                    "destination repeats an earlier one of directory {}, job id {:08x} assigned",
                    dir.alias, job_id
                ),
            );
        }
        jobs.push(JobEntry {
            job_id,
            priority: draft.priority,
            dir_index,
            dir_id: dir.id,
            dir_alias: dir.alias.clone(),
            file_group: draft.group,
            filter: draft.filter,
            local_options: draft.local_options,
            standard_options: draft.standard_options,
            schedules: draft.schedules,
            recipient: draft.recipient,
            url: draft.url,
            scheme: draft.scheme,
            host_alias: alias,
            host_index,
            config_id: dir.config_id,
        });
    }
    let jobs = JobTable::new(jobs, directories.len());
    tracing::info!(
        "compiled {} directories, {} jobs, {} hosts with {} warnings",
        directories.len(),
        jobs.len(),
        hosts.len(),
        warning_list.len()
    );
    Ok(Compiled {
        directories,
        jobs,
        hosts,
        warnings: warning_list,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirconfig::DefaultOptionChecker;
    use crate::testutils::{rule_file, test_settings};

    fn run(files: &[std::path::PathBuf], settings: &CompileSettings) -> Compiled {
        compile(files, settings, &DefaultOptionChecker, None).unwrap()
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path("/a/b/../c"), "/a/c");
        assert_eq!(normalize_path("/../a"), "/a");
        assert_eq!(normalize_path("a/../../b"), "../b");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn expands_home_directory() {
        let home = std::env::var("HOME").unwrap();
        assert_eq!(expand_tilde("~/in").unwrap(), format!("{}/in", home));
        assert_eq!(expand_tilde("/abs").unwrap(), "/abs");
        let root_home = nix::unistd::User::from_name("root").unwrap().unwrap().dir;
        assert_eq!(
            expand_tilde("~root/x").unwrap(),
            format!("{}/x", root_home.display())
        );
        assert!(expand_tilde("~no_such_user_hopefully/x").is_none());
    }

    #[test]
    fn basic_tables() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        let rules = rule_file(
            tmp.path(),
            "rules",
            &format!(
                "[directory] {root}/in obs\n\
                 [files]\n\
                 a*\n\
                 \n\
                 [destination]\n\
                 [recipient]\n\
                 ftp://u:p@host.example.com/dir\n\
                 sftp://u@host.example.com/dir\n\
                 [options]\n\
                 priority 2\n\
                 rename daily\n\
                 archive 3\n",
                root = tmp.path().display()
            ),
        );
        let compiled = run(&[rules], &settings);
        assert!(compiled.warnings.is_empty(), "{:?}", compiled.warnings);
        assert_eq!(compiled.directories.len(), 1);
        let dir = &compiled.directories[0];
        assert_eq!(dir.alias, "obs");
        assert!(tmp.path().join("in").is_dir());
        assert_eq!(compiled.jobs.len(), 2);
        let job = compiled.jobs.get(0).unwrap();
        assert_eq!(job.priority, 2);
        assert_eq!(job.local_options.len(), 1);
        assert_eq!(job.standard_options, ["priority 2", "archive 3"]);
        assert!(job.filter.is_match("apple"));
        assert_eq!(compiled.hosts.len(), 1);
        let host = compiled.hosts.get(0).unwrap();
        assert_eq!(host.alias, "host.example.com");
        assert_eq!(
            host.protocols,
            crate::url::Protocols::FTP | crate::url::Protocols::SFTP
        );
        assert_ne!(job.job_id, compiled.jobs.get(1).unwrap().job_id);
        compiled.validate().unwrap();
    }

    #[test]
    fn groups_jobs_by_directory_after_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        let root = tmp.path().display();
        let block = |dir: &str, host: &str| {
            format!(
                "[directory] {root}/{dir}\n[files]\n*\n\n[destination]\n[recipient]\nftp://u@{host}/x\n\n"
            )
        };
        let content = [
            block("a", "h1"),
            block("b", "h2"),
            // same directory as the first block, spelled differently
            block("a/./", "h3"),
            block("c", "h1"),
        ]
        .concat();
        let rules = rule_file(tmp.path(), "rules", &content);
        let compiled = run(&[rules], &settings);
        assert_eq!(compiled.directories.len(), 3);
        assert_eq!(compiled.jobs.len(), 4);
        for dir_index in 0..compiled.directories.len() {
            let range = compiled.jobs.dir_range(dir_index);
            for (index, job) in compiled.jobs.iter().enumerate() {
                assert_eq!(job.dir_index == dir_index, range.contains(&index));
            }
        }
        let hosts: Vec<_> = compiled
            .jobs
            .dir_jobs(0)
            .iter()
            .map(|job| job.host_alias.as_str())
            .collect();
        assert_eq!(hosts, ["h1", "h3"]);
        compiled.validate().unwrap();

        let mut jobs: Vec<JobEntry> = compiled.jobs.iter().cloned().collect();
        jobs[1].host_index = 99;
        let broken = Compiled {
            jobs: JobTable::new(jobs, compiled.directories.len()),
            ..compiled.clone()
        };
        assert!(matches!(
            broken.validate(),
            Err(CompileError::Inconsistent(_))
        ));
        let mut jobs: Vec<JobEntry> = compiled.jobs.iter().cloned().collect();
        jobs[0].dir_index = 7;
        let broken = Compiled {
            jobs: JobTable::new(jobs, compiled.directories.len()),
            ..compiled
        };
        assert!(broken.validate().is_err());
    }

    #[test]
    fn repeated_destinations_get_their_own_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        let head = format!("[directory] {}/in\n[files]\n*\n\n", tmp.path().display());
        let destination = "[destination]\n[recipient]\nftp://u@h/x\n[options]\ntoupper\n\n";
        let rules = rule_file(
            tmp.path(),
            "rules",
            &format!("{}{}{}", head, destination, destination),
        );
        let compiled = run(std::slice::from_ref(&rules), &settings);
        assert_eq!(compiled.jobs.len(), 2);
        let first = compiled.jobs.get(0).unwrap().job_id;
        let second = compiled.jobs.get(1).unwrap().job_id;
        assert_ne!(first, second);
        assert_eq!(compiled.warnings.len(), 1, "{:?}", compiled.warnings);
        assert!(compiled.warnings[0].message.contains("repeats an earlier one"));
        assert_eq!(compiled.warnings[0].line, 11);
        compiled.validate().unwrap();
        // the first of the two keeps the id it has on its own
        let rules = rule_file(tmp.path(), "rules", &format!("{}{}", head, destination));
        let alone = run(&[rules], &settings);
        assert!(alone.warnings.is_empty());
        assert_eq!(alone.jobs.get(0).unwrap().job_id, first);
    }

    #[test]
    fn same_directory_in_two_rule_files_stays_separate() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        let content = format!(
            "[directory] {}/shared\n[files]\n*\n\n[destination]\n[recipient]\nftp://u@h/x\n",
            tmp.path().display()
        );
        let first = rule_file(tmp.path(), "one", &content);
        let second = rule_file(tmp.path(), "two", &content);
        let compiled = run(&[first, second], &settings);
        assert_eq!(compiled.directories.len(), 2);
        assert_ne!(compiled.directories[0].id, compiled.directories[1].id);
        // both defaulted to "shared"; the second alias is regenerated from its id
        assert_eq!(compiled.directories[0].alias, "shared");
        assert_eq!(
            compiled.directories[1].alias,
            format!("{:08x}", compiled.directories[1].id)
        );
        assert_eq!(compiled.warning_count(), 1);
    }

    #[test]
    fn drops_broken_entries_with_warnings() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        let root = tmp.path().display();
        let content = format!(
            "[directory] {root}/nodest\n[files]\n*\n\n\
             [directory] {root}/ok\n\
             [dir options]\n\
             max process 2\n\
             bogus option\n\
             \n\
             [files]\n\
             [bad\n\
             *.txt\n\
             \n\
             [destination]\n\
             [recipient]\n\
             ftp://user@host:notaport/x\n\
             gopher://host/x\n\
             ftp://user@host/x\n\
             [options]\n\
             convert sideways\n\
             tolower\n\
             \n\
             [directory] relative/path\n"
        );
        let rules = rule_file(tmp.path(), "rules", &content);
        let compiled = run(&[rules], &settings);
        assert_eq!(compiled.directories.len(), 1);
        let dir = &compiled.directories[0];
        assert_eq!(dir.options.max_process, 2);
        assert_eq!(compiled.jobs.len(), 1);
        let job = compiled.jobs.get(0).unwrap();
        assert_eq!(job.recipient, "ftp://user@host/x");
        assert_eq!(job.local_options.len(), 1);
        assert!(job.filter.is_match("a.txt"));
        // bogus option, bad filter, two recipients, one option, no destination, relative path
        assert_eq!(compiled.warning_count(), 7, "{:#?}", compiled.warnings);
    }

    #[test]
    fn missing_directory_without_create_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = test_settings(tmp.path());
        settings.create_source_dir = false;
        let rules = rule_file(
            tmp.path(),
            "rules",
            &format!(
                "[directory] {}/absent\n[files]\n*\n\n[destination]\n[recipient]\nftp://u@h/x\n",
                tmp.path().display()
            ),
        );
        let compiled = run(&[rules], &settings);
        assert!(compiled.directories.is_empty());
        assert!(compiled.jobs.is_empty());
        assert_eq!(compiled.warning_count(), 1);
    }

    #[test]
    fn remote_directory_gets_spool() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        let rules = rule_file(
            tmp.path(),
            "rules",
            "[directory] ftp://user:pw@remote.example.com/outgoing\n[files]\n*\n\n[destination]\n[recipient]\nfile:///tmp/x\n",
        );
        let compiled = run(&[rules], &settings);
        let dir = &compiled.directories[0];
        assert!(dir.is_remote());
        assert_eq!(dir.alias, "outgoing");
        assert!(dir.scan_path().starts_with(&settings.spool_root));
        assert!(dir.scan_path().is_dir());
        assert_eq!(compiled.jobs.get(0).unwrap().host_alias, "localhost");
    }

    #[test]
    fn missing_rule_files() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = test_settings(tmp.path());
        let missing = tmp.path().join("missing");
        let err = compile(&[missing.clone()], &settings, &DefaultOptionChecker, None).unwrap_err();
        assert!(matches!(err, CompileError::NoRuleFile(_)));
        let present = rule_file(tmp.path(), "rules", "");
        let compiled = run(&[missing, present], &settings);
        assert_eq!(compiled.warning_count(), 1);
        // a directory where a file is expected is a real I/O failure
        let err = compile(
            &[tmp.path().to_path_buf()],
            &settings,
            &DefaultOptionChecker,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Read { .. }));
    }

    #[test]
    fn previous_hosts_are_kept_or_pruned() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = test_settings(tmp.path());
        let rules = |host: &str| {
            rule_file(
                tmp.path(),
                "rules",
                &format!(
                    "[directory] {}/in\n[files]\n*\n\n[destination]\n[recipient]\nftp://u@{}/x\n",
                    tmp.path().display(),
                    host
                ),
            )
        };
        let first = run(&[rules("old")], &settings);
        let second = compile(
            &[rules("new")],
            &settings,
            &DefaultOptionChecker,
            Some(&first.hosts),
        )
        .unwrap();
        assert_eq!(second.hosts.len(), 2);
        assert!(!second.hosts.get(second.hosts.find("old").unwrap()).unwrap().seen);
        second.validate().unwrap();
        settings.remove_unused_hosts = true;
        let third = compile(
            &[rules("new")],
            &settings,
            &DefaultOptionChecker,
            Some(&second.hosts),
        )
        .unwrap();
        assert_eq!(third.hosts.len(), 1);
        assert_eq!(third.jobs.get(0).unwrap().host_index, 0);
        third.validate().unwrap();
    }
}
