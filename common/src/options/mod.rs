//! Local option pipeline
//!
//! Every job carries the local options of its destination, parsed once at compile time into
//! [`LocalOption`]. [`apply`] runs them in declaration order over the files in the job's
//! staging directory. A [`PipelineContext`] is owned by exactly one task, so steps never share
//! a batch.
//!
//! A file a step cannot handle is removed from the batch with a warning and a delete log
//! record; a step that cannot run at all (unknown rename rule, missing codec) is skipped.

mod batch;
mod bulletin;
mod codec;
mod convert;
mod exec;
mod rename;
pub mod template;

pub use batch::{Batch, BatchFile};
pub use bulletin::{AssembleFraming, ExtractFraming};
pub use codec::{CodecKind, CodecRegistry, FormatCodec, Wmo2Ascii};
pub use convert::ConvertKind;
pub use exec::{ExecLocks, ExecOutcome, ExecReport, ExecSpec, ExecStats, LockScope};
pub use rename::{RenameRule, RenameRules, RuleMatch};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::dirconfig::JobEntry;
use crate::filter::FileFilter;
use crate::log::{DeleteReason, DeleteRecord, LineLog, ProductionRecord, now_secs};

/// `-N` suffixes tried before a colliding name is overwritten
pub const MAX_COLLISION_ATTEMPTS: u32 = 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LocalOption {
    Rename { rule: String, overwrite: bool },
    Exec(ExecSpec),
    /// cut the name at the first `.`
    Basename { overwrite: bool },
    /// cut the name at the last `.`
    Extension { overwrite: bool },
    AddPrefix(String),
    DelPrefix(String),
    ToUpper,
    ToLower,
    Convert(ConvertKind),
    Codec(CodecKind),
    Extract {
        framing: ExtractFraming,
        filter: Option<FileFilter>,
    },
    Assemble {
        framing: AssembleFraming,
        template: String,
    },
}

fn overwrite_flag(keyword: &str, rest: &str) -> Result<bool, String> {
    match rest {
        "" => Ok(false),
        "overwrite" => Ok(true),
        other => Err(format!("{}: unexpected '{}'", keyword, other)),
    }
}

impl LocalOption {
    /// Parses an option line; `Ok(None)` when the line is not a local option at all.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        let (keyword, rest) = match line.split_once(char::is_whitespace) {
            Some((keyword, rest)) => (keyword, rest.trim()),
            None => (line, ""),
        };
        let option = match keyword {
            "rename" => {
                let mut words = rest.split_whitespace();
                let Some(rule) = words.next() else {
                    return Err("rename needs a rule name".to_string());
                };
                let overwrite = overwrite_flag(keyword, &words.collect::<Vec<_>>().join(" "))?;
                Self::Rename {
                    rule: rule.to_string(),
                    overwrite,
                }
            }
            "exec" | "execd" => Self::Exec(ExecSpec::parse(keyword == "execd", rest)?),
            "basename" => Self::Basename {
                overwrite: overwrite_flag(keyword, rest)?,
            },
            "extension" => Self::Extension {
                overwrite: overwrite_flag(keyword, rest)?,
            },
            "prefix" => match rest.split_once(char::is_whitespace) {
                Some(("add", prefix)) if !prefix.trim().is_empty() => {
                    Self::AddPrefix(prefix.trim().to_string())
                }
                Some(("del", prefix)) if !prefix.trim().is_empty() => {
                    Self::DelPrefix(prefix.trim().to_string())
                }
                _ => return Err(format!("expected 'prefix add|del <text>', got '{}'", line)),
            },
            "toupper" | "tolower" if !rest.is_empty() => {
                return Err(format!("{} takes no arguments", keyword));
            }
            "toupper" => Self::ToUpper,
            "tolower" => Self::ToLower,
            "convert" => match ConvertKind::from_name(rest) {
                Some(kind) => Self::Convert(kind),
                None => return Err(format!("unknown conversion '{}'", rest)),
            },
            "extract" => {
                let (framing, filter) = match rest.split_once(char::is_whitespace) {
                    Some((framing, filter)) => (framing, Some(filter.trim())),
                    None => (rest, None),
                };
                let framing = ExtractFraming::from_name(framing)
                    .ok_or_else(|| format!("unknown extract framing '{}'", framing))?;
                let filter = filter
                    .map(|pattern| {
                        FileFilter::from_patterns([pattern]).map_err(|error| format!("{:#}", error))
                    })
                    .transpose()?;
                Self::Extract { framing, filter }
            }
            "assemble" => {
                let Some((framing, template)) = rest.split_once(char::is_whitespace) else {
                    return Err("assemble needs a framing and a name template".to_string());
                };
                let framing = AssembleFraming::from_name(framing)
                    .ok_or_else(|| format!("unknown assemble framing '{}'", framing))?;
                Self::Assemble {
                    framing,
                    template: template.trim().to_string(),
                }
            }
            other => match CodecKind::from_name(other) {
                Some(kind) if rest.is_empty() => Self::Codec(kind),
                Some(_) => return Err(format!("{} takes no arguments", other)),
                None => return Ok(None),
            },
        };
        Ok(Some(option))
    }
}

/// State shared by every pipeline run of the daemon
#[derive(Debug)]
pub struct PipelineEnv {
    rename_rules: std::sync::RwLock<std::sync::Arc<RenameRules>>,
    pub production_log: LineLog,
    pub delete_log: LineLog,
    pub locks: ExecLocks,
    pub exec_stats: ExecStats,
    pub codecs: CodecRegistry,
    /// failed files are moved below this directory instead of deleted when requested
    pub error_store: Option<std::path::PathBuf>,
    pub hostname: String,
    counter: std::sync::atomic::AtomicU32,
}

impl Default for PipelineEnv {
    fn default() -> Self {
        Self {
            rename_rules: Default::default(),
            production_log: LineLog::disabled(),
            delete_log: LineLog::disabled(),
            locks: ExecLocks::default(),
            exec_stats: ExecStats::default(),
            codecs: CodecRegistry::default(),
            error_store: None,
            hostname: crate::url::timefmt::local_hostname(),
            counter: Default::default(),
        }
    }
}

impl PipelineEnv {
    pub fn new(
        production_log: LineLog,
        delete_log: LineLog,
        error_store: Option<std::path::PathBuf>,
    ) -> Self {
        Self {
            production_log,
            delete_log,
            error_store,
            ..Self::default()
        }
    }

    pub fn rename_rules(&self) -> std::sync::Arc<RenameRules> {
        self.rename_rules
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn set_rename_rules(&self, rules: RenameRules) {
        *self
            .rename_rules
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = std::sync::Arc::new(rules);
    }

    /// Daemon-wide counter behind the `%n` template token.
    pub fn next_counter(&self) -> u32 {
        self.counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub options_applied: usize,
    pub options_skipped: usize,
    pub files_renamed: usize,
    pub files_converted: usize,
    pub files_created: usize,
    pub files_dropped: usize,
    pub warnings: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            options_applied: self.options_applied + other.options_applied,
            options_skipped: self.options_skipped + other.options_skipped,
            files_renamed: self.files_renamed + other.files_renamed,
            files_converted: self.files_converted + other.files_converted,
            files_created: self.files_created + other.files_created,
            files_dropped: self.files_dropped + other.files_dropped,
            warnings: self.warnings + other.warnings,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "options applied: {}\n\
            options skipped: {}\n\
            files renamed: {}\n\
            files converted: {}\n\
            files created: {}\n\
            files dropped: {}\n\
            warnings: {}",
            self.options_applied,
            self.options_skipped,
            self.files_renamed,
            self.files_converted,
            self.files_created,
            self.files_dropped,
            self.warnings,
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

/// One job's view of its staging directory
pub struct PipelineContext<'a> {
    pub env: &'a PipelineEnv,
    pub job: &'a JobEntry,
    pub staging: std::path::PathBuf,
    pub batch: Batch,
    summary: Summary,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        env: &'a PipelineEnv,
        job: &'a JobEntry,
        staging: std::path::PathBuf,
        batch: Batch,
    ) -> Self {
        Self {
            env,
            job,
            staging,
            batch,
            summary: Summary::default(),
        }
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.staging.join(name)
    }

    pub fn summary(&self) -> Summary {
        self.summary
    }

    fn warn(&mut self, message: std::fmt::Arguments) {
        tracing::warn!("job {:08x}: {}", self.job.job_id, message);
        self.summary.warnings += 1;
    }

    /// Replaces the batch with what is on disk now.
    async fn recount(&mut self) -> anyhow::Result<()> {
        self.batch = Batch::from_dir(&self.staging)
            .await
            .with_context(|| format!("failed to recount staging directory {:?}", self.staging))?;
        Ok(())
    }

    /// Whether `name` is used by a batch entry other than `except` or by a file on disk.
    async fn is_taken(&self, name: &str, except: Option<usize>) -> bool {
        if self
            .batch
            .position(name)
            .is_some_and(|index| Some(index) != except)
        {
            return true;
        }
        tokio::fs::try_exists(self.path(name)).await.unwrap_or(true)
    }

    /// Smallest free `<name>-N`, if any is left.
    async fn free_variant(&self, name: &str, except: Option<usize>) -> Option<String> {
        for attempt in 0..MAX_COLLISION_ATTEMPTS {
            let candidate = format!("{}-{}", name, attempt);
            if !self.is_taken(&candidate, except).await {
                return Some(candidate);
            }
        }
        None
    }

    async fn log_production(
        &self,
        option: &str,
        original: &BatchFile,
        new_name: &str,
        new_size: u64,
        exit_code: i32,
    ) {
        let record = ProductionRecord {
            time: now_secs(),
            dir_id: self.job.dir_id,
            job_id: self.job.job_id,
            original_name: original.name.clone(),
            original_size: original.size,
            new_name: new_name.to_string(),
            new_size,
            option: option.to_string(),
            exit_code,
        };
        if let Err(error) = self.env.production_log.write(&record).await {
            tracing::warn!("{:#}", error);
        }
    }

    /// Removes one file from the batch and from disk, moving it to the error store if asked.
    async fn drop_file(
        &mut self,
        index: usize,
        reason: DeleteReason,
        option: &str,
        detail: &str,
        save: bool,
    ) {
        let file = self.batch.files.remove(index);
        self.warn(format_args!(
            "'{}' dropped while applying '{}': {}",
            file.name, option, detail
        ));
        self.summary.files_dropped += 1;
        let path = self.path(&file.name);
        let saved = match (&self.env.error_store, save) {
            (Some(store), true) => {
                let dir = store.join(format!("{:08x}", self.job.job_id));
                let moved = async {
                    tokio::fs::create_dir_all(&dir).await?;
                    tokio::fs::rename(&path, dir.join(&file.name)).await
                };
                match moved.await {
                    Ok(()) => true,
                    Err(error) => {
                        tracing::warn!("failed to save {:?} in {:?}: {}", path, dir, error);
                        false
                    }
                }
            }
            _ => false,
        };
        if !saved
            && let Err(error) = tokio::fs::remove_file(&path).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("failed to remove {:?}: {}", path, error);
        }
        let record = DeleteRecord {
            time: now_secs(),
            dir_id: self.job.dir_id,
            job_id: Some(self.job.job_id),
            file_name: file.name,
            size: file.size,
            reason,
            detail: format!("{}: {}", option, detail),
        };
        if let Err(error) = self.env.delete_log.write(&record).await {
            tracing::warn!("{:#}", error);
        }
    }
}

fn valid_file_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/')
}

/// Renames batch entries by `target_of`; `None` keeps a name.
///
/// A target already in use gets the first free `-N` suffix, or with `overwrite` replaces the
/// entry holding it. After [`MAX_COLLISION_ATTEMPTS`] suffixes the target is overwritten anyway.
async fn rename_batch<F>(
    ctx: &mut PipelineContext<'_>,
    option: &str,
    overwrite: bool,
    mut target_of: F,
) where
    F: FnMut(&str) -> Option<String>,
{
    let mut index = 0;
    while index < ctx.batch.len() {
        let original = ctx.batch.files[index].clone();
        let Some(target) = target_of(&original.name) else {
            index += 1;
            continue;
        };
        if target == original.name {
            index += 1;
            continue;
        }
        if target.is_empty() {
            ctx.drop_file(index, DeleteReason::OptionFailed, option, "empty file name", false)
                .await;
            continue;
        }
        if !valid_file_name(&target) {
            let detail = format!("'{}' is not a valid file name", target);
            ctx.drop_file(index, DeleteReason::OptionFailed, option, &detail, false)
                .await;
            continue;
        }
        let mut new_name = target.clone();
        let mut replace = false;
        if ctx.is_taken(&target, Some(index)).await {
            if overwrite {
                replace = true;
            } else {
                match ctx.free_variant(&target, Some(index)).await {
                    Some(variant) => new_name = variant,
                    None => {
                        ctx.warn(format_args!(
                            "no free name for '{}' after {} attempts, overwriting '{}'",
                            original.name, MAX_COLLISION_ATTEMPTS, target
                        ));
                        replace = true;
                    }
                }
            }
        }
        if replace {
            match ctx.batch.position(&new_name) {
                Some(other) => {
                    let lost = ctx.batch.files.remove(other);
                    if other < index {
                        index -= 1;
                    }
                    ctx.warn(format_args!(
                        "'{}' overwrites '{}' while applying '{}'",
                        original.name, lost.name, option
                    ));
                    let record = DeleteRecord {
                        time: now_secs(),
                        dir_id: ctx.job.dir_id,
                        job_id: Some(ctx.job.job_id),
                        file_name: lost.name,
                        size: lost.size,
                        reason: DeleteReason::Duplicate,
                        detail: format!("{}: overwritten by {}", option, original.name),
                    };
                    if let Err(error) = ctx.env.delete_log.write(&record).await {
                        tracing::warn!("{:#}", error);
                    }
                }
                None => ctx.warn(format_args!(
                    "'{}' overwrites existing file '{}'",
                    original.name, new_name
                )),
            }
        }
        if let Err(error) =
            tokio::fs::rename(ctx.path(&original.name), ctx.path(&new_name)).await
        {
            let detail = format!("rename to '{}' failed: {}", new_name, error);
            ctx.drop_file(index, DeleteReason::OptionFailed, option, &detail, false)
                .await;
            continue;
        }
        tracing::debug!("renamed {:?} -> {:?}", original.name, new_name);
        ctx.batch.files[index].name = new_name.clone();
        ctx.summary.files_renamed += 1;
        ctx.log_production(option, &original, &new_name, original.size, 0)
            .await;
        index += 1;
    }
}

async fn rename_by_rule(ctx: &mut PipelineContext<'_>, option: &str, rule: &str, overwrite: bool) {
    let rules = ctx.env.rename_rules();
    let Some(rule) = rules.get(rule) else {
        ctx.warn(format_args!("rename rule '{}' does not exist, option skipped", rule));
        ctx.summary.options_skipped += 1;
        return;
    };
    let env = ctx.env;
    let time = now_secs();
    rename_batch(ctx, option, overwrite, |name| match rule.lookup(name) {
        RuleMatch::Keep => None,
        RuleMatch::Rename { target, captures } => Some(template::expand(
            target,
            &template::TemplateValues {
                captures: Some(&captures),
                time,
                hostname: &env.hostname,
                counter: env.next_counter(),
            },
        )),
    })
    .await;
}

fn temp_path(path: &std::path::Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}", name))
}

/// Writes `data` to a new file renamed over `path`.
///
/// Staging files are hard links shared with the other jobs of the directory, so the old inode
/// must never be written to.
async fn replace_contents(path: &std::path::Path, data: &[u8]) -> std::io::Result<()> {
    let temp = temp_path(path);
    let written = async {
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok::<(), std::io::Error>(())
    };
    if let Err(error) = written.await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(error);
    }
    Ok(())
}

/// Gives `path` an inode of its own if other links share it.
async fn unshare(path: &std::path::Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let metadata = tokio::fs::symlink_metadata(path).await?;
    if !metadata.is_file() || metadata.nlink() <= 1 {
        return Ok(false);
    }
    let temp = temp_path(path);
    let copied = async {
        tokio::fs::copy(path, &temp).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok::<(), std::io::Error>(())
    };
    if let Err(error) = copied.await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(error);
    }
    Ok(true)
}

async fn convert_files(ctx: &mut PipelineContext<'_>, option: &str, kind: ConvertKind) {
    let mut index = 0;
    while index < ctx.batch.len() {
        let original = ctx.batch.files[index].clone();
        let path = ctx.path(&original.name);
        let converted = async {
            let data = tokio::fs::read(&path).await?;
            let out = convert::convert(kind, &data);
            replace_contents(&path, &out).await?;
            Ok::<u64, std::io::Error>(out.len() as u64)
        };
        match converted.await {
            Ok(size) => {
                ctx.batch.files[index].size = size;
                ctx.summary.files_converted += 1;
                ctx.log_production(option, &original, &original.name, size, 0)
                    .await;
                index += 1;
            }
            Err(error) => {
                let detail = format!("conversion failed: {}", error);
                ctx.drop_file(index, DeleteReason::OptionFailed, option, &detail, false)
                    .await;
            }
        }
    }
}

async fn run_codec(
    ctx: &mut PipelineContext<'_>,
    option: &str,
    kind: CodecKind,
) -> anyhow::Result<()> {
    let Some(codec) = ctx.env.codecs.get(kind).cloned() else {
        ctx.warn(format_args!("codec {} is not available, option skipped", kind.name()));
        ctx.summary.options_skipped += 1;
        return Ok(());
    };
    let originals = ctx.batch.files.clone();
    let mut failed = false;
    for original in &originals {
        let path = ctx.path(&original.name);
        let result = match tokio::fs::read(&path).await {
            Ok(data) => {
                let codec = codec.clone();
                let name = original.name.clone();
                tokio::task::spawn_blocking(move || codec.convert(&name, &data))
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|converted| converted)
            }
            Err(error) => Err(error.into()),
        };
        let written = match result {
            Ok(data) => replace_contents(&path, &data)
                .await
                .map(|_| data.len() as u64)
                .map_err(anyhow::Error::from),
            Err(error) => Err(error),
        };
        match written {
            Ok(size) => {
                ctx.summary.files_converted += 1;
                ctx.log_production(option, original, &original.name, size, 0)
                    .await;
            }
            Err(error) => {
                if let Some(index) = ctx.batch.position(&original.name) {
                    let detail = format!("{:#}", error);
                    ctx.drop_file(index, DeleteReason::OptionFailed, option, &detail, false)
                        .await;
                }
                failed = true;
            }
        }
    }
    if failed {
        tracing::debug!("codec {} dropped files, recounting", kind.name());
    }
    ctx.recount().await?;
    Ok(())
}

fn cut_at(name: &str, position: Option<usize>) -> Option<String> {
    position.map(|idx| name[..idx].to_string())
}

/// Runs every local option of the job, in declaration order, over the staging batch.
///
/// Per-file failures are absorbed; an `Err` means the staging directory itself became
/// unreadable.
#[instrument(skip(ctx), fields(job_id = ctx.job.job_id))]
pub async fn apply(ctx: &mut PipelineContext<'_>) -> Result<Summary, Error> {
    let job = ctx.job;
    for configured in &job.local_options {
        if ctx.batch.is_empty() {
            tracing::debug!("batch is empty, remaining options not applied");
            break;
        }
        let line = configured.line.as_str();
        tracing::debug!("applying '{}' to {} files", line, ctx.batch.len());
        let stepped: anyhow::Result<()> = match &configured.option {
            LocalOption::Rename { rule, overwrite } => {
                rename_by_rule(ctx, line, rule, *overwrite).await;
                Ok(())
            }
            LocalOption::Exec(spec) => exec::run(ctx, line, spec).await,
            LocalOption::Basename { overwrite } => {
                rename_batch(ctx, line, *overwrite, |name| cut_at(name, name.find('.'))).await;
                Ok(())
            }
            LocalOption::Extension { overwrite } => {
                rename_batch(ctx, line, *overwrite, |name| cut_at(name, name.rfind('.'))).await;
                Ok(())
            }
            LocalOption::AddPrefix(prefix) => {
                rename_batch(ctx, line, false, |name| Some(format!("{}{}", prefix, name))).await;
                Ok(())
            }
            LocalOption::DelPrefix(prefix) => {
                rename_batch(ctx, line, false, |name| {
                    name.strip_prefix(prefix.as_str()).map(str::to_string)
                })
                .await;
                Ok(())
            }
            LocalOption::ToUpper => {
                rename_batch(ctx, line, false, |name| Some(name.to_uppercase())).await;
                Ok(())
            }
            LocalOption::ToLower => {
                rename_batch(ctx, line, false, |name| Some(name.to_lowercase())).await;
                Ok(())
            }
            LocalOption::Convert(kind) => {
                convert_files(ctx, line, *kind).await;
                Ok(())
            }
            LocalOption::Codec(kind) => run_codec(ctx, line, *kind).await,
            LocalOption::Extract { framing, filter } => {
                bulletin::extract(ctx, line, *framing, filter.as_ref()).await
            }
            LocalOption::Assemble { framing, template } => {
                bulletin::assemble(ctx, line, *framing, template).await
            }
        };
        if let Err(error) = stepped {
            return Err(Error::new(error, ctx.summary));
        }
        ctx.summary.options_applied += 1;
    }
    Ok(ctx.summary)
}

#[cfg(test)]
mod tests;
