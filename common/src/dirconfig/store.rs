use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

use super::{CompileError, Compiled, DirectoryEntry, HostTable, JobTable};
use crate::version::BuildVersion;

/// On-disk form of a compiled table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTable {
    pub version: BuildVersion,
    pub directories: Vec<DirectoryEntry>,
    pub jobs: JobTable,
    pub hosts: HostTable,
}

impl StoredTable {
    pub fn into_compiled(self) -> Compiled {
        Compiled {
            directories: self.directories,
            jobs: self.jobs,
            hosts: self.hosts,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReport {
    pub bytes: u64,
    /// the previous table was removed to make room
    pub discarded_backup: bool,
}

fn with_suffix(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    name.into()
}

/// Writes `compiled` to `path`, keeping the previous table as `<path>.old`.
///
/// When the serialized table is larger than `byte_budget` (0 = unbounded), or the disk fills
/// up while writing, the backup is deleted so the new table can still be written.
pub fn store(
    compiled: &Compiled,
    path: &std::path::Path,
    byte_budget: u64,
) -> Result<StoreReport, CompileError> {
    let to_store_error = |source: anyhow::Error| CompileError::Store {
        path: path.to_path_buf(),
        source,
    };
    let table = StoredTable {
        version: BuildVersion::current(),
        directories: compiled.directories.clone(),
        jobs: compiled.jobs.clone(),
        hosts: compiled.hosts.clone(),
    };
    let bytes = serde_json::to_vec(&table)
        .context("failed to serialize the job table")
        .map_err(to_store_error)?;
    let backup = with_suffix(path, ".old");
    let temp = with_suffix(path, ".tmp");
    let mut discarded_backup = false;
    if path.exists() {
        std::fs::rename(path, &backup)
            .with_context(|| format!("failed to move {:?} to {:?}", path, backup))
            .map_err(to_store_error)?;
    }
    let discard_backup = |reason: &str| -> anyhow::Result<bool> {
        match std::fs::remove_file(&backup) {
            Ok(()) => {
                tracing::warn!("discarded backup {:?}: {}", backup, reason);
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => {
                Err(anyhow!(error).context(format!("failed to remove backup {:?}", backup)))
            }
        }
    };
    if byte_budget > 0 && bytes.len() as u64 > byte_budget {
        discarded_backup = discard_backup(&format!(
            "table needs {} but the budget is {}",
            bytesize::ByteSize(bytes.len() as u64),
            bytesize::ByteSize(byte_budget)
        ))
        .map_err(to_store_error)?;
    }
    if let Err(error) = std::fs::write(&temp, &bytes) {
        let _ = std::fs::remove_file(&temp);
        if error.kind() != std::io::ErrorKind::StorageFull || discarded_backup {
            return Err(to_store_error(
                anyhow!(error).context(format!("failed to write {:?}", temp)),
            ));
        }
        discarded_backup = discard_backup("disk full").map_err(to_store_error)?;
        std::fs::write(&temp, &bytes)
            .with_context(|| format!("failed to write {:?} after freeing space", temp))
            .map_err(to_store_error)?;
    }
    std::fs::rename(&temp, path)
        .with_context(|| format!("failed to move {:?} to {:?}", temp, path))
        .map_err(to_store_error)?;
    tracing::debug!("stored job table at {:?} ({} bytes)", path, bytes.len());
    Ok(StoreReport {
        bytes: bytes.len() as u64,
        discarded_backup,
    })
}

/// Reads a table written by [`store`], refusing tables of another layout.
pub fn load(path: &std::path::Path) -> anyhow::Result<StoredTable> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let table: StoredTable = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse job table {:?}", path))?;
    let ours = BuildVersion::current();
    if !ours.is_compatible_with(&table.version) {
        return Err(anyhow!(
            "job table {:?} was written by {} with layout {}, this build reads layout {}",
            path,
            table.version,
            table.version.format,
            ours.format
        ));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirconfig::{DefaultOptionChecker, compile};
    use crate::testutils::{rule_file, test_settings};

    fn sample(tmp: &std::path::Path) -> Compiled {
        let rules = rule_file(
            tmp,
            "rules",
            &format!(
                "[directory] {}/in\n[files]\n*\n\n[destination]\n[recipient]\nftp://u@h/x\n[options]\ntoupper\n",
                tmp.display()
            ),
        );
        compile(&[rules], &test_settings(tmp), &DefaultOptionChecker, None).unwrap()
    }

    #[test]
    fn store_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let compiled = sample(tmp.path());
        let path = tmp.path().join("table.json");
        let report = store(&compiled, &path, 0).unwrap();
        assert!(!report.discarded_backup);
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.directories, compiled.directories);
        assert_eq!(loaded.hosts, compiled.hosts);
        assert_eq!(loaded.jobs.len(), 1);
        let loaded = loaded.into_compiled();
        assert_eq!(loaded.jobs.get(0), compiled.jobs.get(0));
        loaded.validate().unwrap();
        // the second store keeps the first one as backup
        store(&compiled, &path, 0).unwrap();
        assert!(with_suffix(&path, ".old").exists());
        assert!(!with_suffix(&path, ".tmp").exists());
    }

    #[test]
    fn over_budget_discards_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let compiled = sample(tmp.path());
        let path = tmp.path().join("table.json");
        store(&compiled, &path, 0).unwrap();
        let report = store(&compiled, &path, 16).unwrap();
        assert!(report.discarded_backup);
        assert!(report.bytes > 16);
        assert!(!with_suffix(&path, ".old").exists());
        assert!(load(&path).is_ok());
    }

    #[test]
    fn rejects_other_layouts() {
        let tmp = tempfile::tempdir().unwrap();
        let compiled = sample(tmp.path());
        let path = tmp.path().join("table.json");
        store(&compiled, &path, 0).unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        value["version"]["format"] = serde_json::json!(999);
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        let error = load(&path).unwrap_err();
        assert!(format!("{:#}", error).contains("layout 999"));
    }
}
