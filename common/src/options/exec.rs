//! `exec` and `execd`
//!
//! `exec [-t <secs>] [-l|-L] [-d] [-D] [-s] <command>` runs `command` through `sh -c` inside the
//! staging directory. Every `%s` is replaced by the (quoted) file name and the command runs once
//! per file; without `%s` it runs once for the whole batch. `execd` deletes the files the
//! command was given afterwards, whatever the exit code.
//!
//! Flags: `-t` timeout, `-l` one run at a time per job, `-L` one run at a time overall, `-d`
//! delete the file on failure, `-D` delete the whole batch on failure, `-s` move failed files to
//! the error store.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use super::PipelineContext;
use crate::log::DeleteReason;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    #[default]
    None,
    Job,
    All,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    pub command: String,
    pub delete_originals: bool,
    /// seconds
    pub timeout: Option<u64>,
    pub lock: LockScope,
    pub delete_file: bool,
    pub delete_batch: bool,
    pub save_file: bool,
}

impl ExecSpec {
    pub fn parse(delete_originals: bool, args: &str) -> Result<Self, String> {
        let mut spec = Self {
            command: String::new(),
            delete_originals,
            timeout: None,
            lock: LockScope::None,
            delete_file: false,
            delete_batch: false,
            save_file: false,
        };
        let mut rest = args.trim_start();
        loop {
            let (word, after) = match rest.split_once(char::is_whitespace) {
                Some((word, after)) => (word, after.trim_start()),
                None => (rest, ""),
            };
            match word {
                "-t" => {
                    let (value, after) = match after.split_once(char::is_whitespace) {
                        Some((value, after)) => (value, after.trim_start()),
                        None => (after, ""),
                    };
                    let seconds = value
                        .parse::<u64>()
                        .map_err(|_| format!("exec: invalid timeout '{}'", value))?;
                    spec.timeout = Some(seconds);
                    rest = after;
                    continue;
                }
                "-l" => spec.lock = LockScope::Job,
                "-L" => spec.lock = LockScope::All,
                "-d" => spec.delete_file = true,
                "-D" => spec.delete_batch = true,
                "-s" => spec.save_file = true,
                _ => break,
            }
            rest = after;
        }
        if rest.is_empty() {
            return Err("exec: missing command".to_string());
        }
        spec.command = rest.to_string();
        Ok(spec)
    }

    pub fn per_file(&self) -> bool {
        self.command.contains("%s")
    }
}

/// Locks behind `-l` and `-L`
#[derive(Debug, Default)]
pub struct ExecLocks {
    all: std::sync::Arc<tokio::sync::Mutex<()>>,
    jobs: std::sync::Mutex<std::collections::HashMap<u32, std::sync::Arc<tokio::sync::Mutex<()>>>>,
}

impl ExecLocks {
    pub async fn acquire(
        &self,
        scope: LockScope,
        job_id: u32,
    ) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let lock = match scope {
            LockScope::None => return None,
            LockScope::All => self.all.clone(),
            LockScope::Job => self
                .jobs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .entry(job_id)
                .or_default()
                .clone(),
        };
        Some(lock.lock_owned().await)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, enum_map::Enum)]
pub enum ExecOutcome {
    Success,
    Failed,
    TimedOut,
    SpawnFailed,
}

/// Counters reported on the statistics command
#[derive(Debug, Default)]
pub struct ExecStats {
    counts: enum_map::EnumMap<ExecOutcome, AtomicU64>,
    busy_micros: AtomicU64,
}

impl ExecStats {
    fn record(&self, outcome: ExecOutcome, elapsed: std::time::Duration) {
        self.counts[outcome].fetch_add(1, Ordering::Relaxed);
        self.busy_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn report(&self) -> ExecReport {
        ExecReport {
            counts: enum_map::EnumMap::from_fn(|outcome| {
                self.counts[outcome].load(Ordering::Relaxed)
            }),
            busy: std::time::Duration::from_micros(self.busy_micros.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecReport {
    pub counts: enum_map::EnumMap<ExecOutcome, u64>,
    pub busy: std::time::Duration,
}

impl std::fmt::Display for ExecReport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "exec runs: {} ok, {} failed, {} timed out, {} not started, {} busy",
            self.counts[ExecOutcome::Success],
            self.counts[ExecOutcome::Failed],
            self.counts[ExecOutcome::TimedOut],
            self.counts[ExecOutcome::SpawnFailed],
            humantime::format_duration(std::time::Duration::from_secs(self.busy.as_secs())),
        )
    }
}

fn shell_quote(name: &str) -> String {
    format!("'{}'", name.replace('\'', r"'\''"))
}

struct RunResult {
    outcome: ExecOutcome,
    exit_code: i32,
    stderr: String,
}

async fn run_shell(
    command: &str,
    cwd: &std::path::Path,
    timeout: Option<std::time::Duration>,
) -> RunResult {
    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(error) => {
            return RunResult {
                outcome: ExecOutcome::SpawnFailed,
                exit_code: -1,
                stderr: error.to_string(),
            };
        }
    };
    let output = match timeout {
        // dropping the future kills the child
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output,
            Err(_) => {
                return RunResult {
                    outcome: ExecOutcome::TimedOut,
                    exit_code: -1,
                    stderr: format!("killed after {:?}", limit),
                };
            }
        },
        None => child.wait_with_output().await,
    };
    match output {
        Ok(output) => RunResult {
            outcome: if output.status.success() {
                ExecOutcome::Success
            } else {
                ExecOutcome::Failed
            },
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        },
        Err(error) => RunResult {
            outcome: ExecOutcome::Failed,
            exit_code: -1,
            stderr: error.to_string(),
        },
    }
}

/// Runs one `exec`/`execd` option over the batch, then recounts it from disk.
pub(super) async fn run(
    ctx: &mut PipelineContext<'_>,
    option: &str,
    spec: &ExecSpec,
) -> anyhow::Result<()> {
    let _guard = ctx.env.locks.acquire(spec.lock, ctx.job.job_id).await;
    let timeout = spec.timeout.map(std::time::Duration::from_secs);
    let originals = ctx.batch.files.clone();
    // commands may edit files in place
    for original in &originals {
        let path = ctx.path(&original.name);
        match super::unshare(&path).await {
            Ok(true) => tracing::trace!("{:?} now has its own copy", path),
            Ok(false) => {}
            Err(error) => tracing::warn!("failed to unshare {:?}: {}", path, error),
        }
    }
    // (command line, files it was given)
    let runs: Vec<(String, Vec<usize>)> = if spec.per_file() {
        originals
            .iter()
            .enumerate()
            .map(|(idx, file)| (spec.command.replace("%s", &shell_quote(&file.name)), vec![idx]))
            .collect()
    } else {
        vec![(spec.command.clone(), (0..originals.len()).collect())]
    };
    let mut exit_codes = vec![0; originals.len()];
    for (command, given) in runs {
        let started = std::time::Instant::now();
        let result = run_shell(&command, &ctx.staging, timeout).await;
        ctx.env.exec_stats.record(result.outcome, started.elapsed());
        for idx in &given {
            exit_codes[*idx] = result.exit_code;
        }
        if result.outcome != ExecOutcome::Success {
            let detail = format!(
                "'{}' {:?} (exit code {}): {}",
                command, result.outcome, result.exit_code, result.stderr
            );
            if spec.delete_batch {
                while !ctx.batch.is_empty() {
                    ctx.drop_file(0, DeleteReason::ExecFailed, option, &detail, spec.save_file)
                        .await;
                }
                break;
            } else if spec.delete_file || spec.save_file {
                for idx in &given {
                    if let Some(index) = ctx.batch.position(&originals[*idx].name) {
                        ctx.drop_file(
                            index,
                            DeleteReason::ExecFailed,
                            option,
                            &detail,
                            spec.save_file,
                        )
                        .await;
                    }
                }
            } else {
                ctx.warn(format_args!("{}", detail));
            }
        }
        if spec.delete_originals {
            for idx in &given {
                let path = ctx.path(&originals[*idx].name);
                if let Err(error) = tokio::fs::remove_file(&path).await
                    && error.kind() != std::io::ErrorKind::NotFound
                {
                    tracing::warn!("failed to remove {:?}: {}", path, error);
                }
            }
        }
    }
    for (original, exit_code) in originals.iter().zip(exit_codes) {
        let (new_name, new_size) = match tokio::fs::metadata(ctx.path(&original.name)).await {
            Ok(metadata) => (original.name.as_str(), metadata.len()),
            Err(_) => ("", 0),
        };
        ctx.log_production(option, original, new_name, new_size, exit_code)
            .await;
    }
    ctx.recount().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_command() {
        let spec = ExecSpec::parse(false, "-t 30 -l -d gzip -9 %s").unwrap();
        assert_eq!(spec.timeout, Some(30));
        assert_eq!(spec.lock, LockScope::Job);
        assert!(spec.delete_file);
        assert!(!spec.delete_originals);
        assert_eq!(spec.command, "gzip -9 %s");
        assert!(spec.per_file());
        let spec = ExecSpec::parse(true, "-L -D -s cat * > all").unwrap();
        assert_eq!(spec.lock, LockScope::All);
        assert!(spec.delete_batch && spec.save_file && spec.delete_originals);
        assert!(!spec.per_file());
        assert!(ExecSpec::parse(false, "-t x true").is_err());
        assert!(ExecSpec::parse(false, "-d").is_err());
    }

    #[test]
    fn quotes_names_for_the_shell() {
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let tmp = tempfile::tempdir().unwrap();
        let result = run_shell(
            "sleep 5",
            tmp.path(),
            Some(std::time::Duration::from_millis(100)),
        )
        .await;
        assert_eq!(result.outcome, ExecOutcome::TimedOut);
        let result = run_shell("echo oops >&2; exit 3", tmp.path(), None).await;
        assert_eq!(result.outcome, ExecOutcome::Failed);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr, "oops");
    }

    #[tokio::test]
    async fn job_lock_serializes_same_job() {
        let locks = ExecLocks::default();
        let guard = locks.acquire(LockScope::Job, 1).await;
        assert!(guard.is_some());
        // another job is not blocked
        let other = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            locks.acquire(LockScope::Job, 2),
        )
        .await;
        assert!(other.is_ok());
        let same = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            locks.acquire(LockScope::Job, 1),
        )
        .await;
        assert!(same.is_err());
        assert!(locks.acquire(LockScope::None, 1).await.is_none());
    }

    #[test]
    fn stats_report() {
        let stats = ExecStats::default();
        stats.record(ExecOutcome::Success, std::time::Duration::from_secs(2));
        stats.record(ExecOutcome::TimedOut, std::time::Duration::from_secs(1));
        let report = stats.report();
        assert_eq!(report.counts[ExecOutcome::Success], 1);
        assert_eq!(report.busy, std::time::Duration::from_secs(3));
        assert_eq!(
            report.to_string(),
            "exec runs: 1 ok, 0 failed, 1 timed out, 0 not started, 3s busy"
        );
    }
}
