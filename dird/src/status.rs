//! Mutable per-directory state
//!
//! The compiled [`common::dirconfig::DirectoryEntry`] never changes; everything the loop learns
//! about a directory lives in a [`DirStatus`] cell shared with the workers processing it.

use common::dirconfig::DirectoryEntry;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DirState {
    #[default]
    Idle,
    Active,
    /// too many consecutive errors; still scanned
    Error,
    /// not scanned until started again
    Stopped,
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievedFile {
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Default)]
pub struct DirStatus {
    /// directory modification time seen by the last scan
    pub search_time: i64,
    /// clock reading when that scan happened
    pub scanned_at: i64,
    pub last_retrieval: i64,
    pub error_counter: u32,
    pub state: DirState,
    pub force_reread: bool,
    /// a warn time alert was logged and no file arrived since
    pub warned: bool,
    /// files copied from a `do not remove` directory
    pub retrieved: std::collections::HashMap<String, RetrievedFile>,
    pub files_received: u64,
    pub bytes_received: u64,
    pub files_queued: u64,
}

impl DirStatus {
    fn new(dir: &DirectoryEntry, now: i64) -> Self {
        Self {
            last_retrieval: now,
            force_reread: dir.options.force_reread,
            ..Default::default()
        }
    }

    /// A directory modified in the same second it was last scanned may have gained files
    /// after that scan, so it is scanned again.
    pub fn needs_scan(&self, mtime: i64) -> bool {
        self.force_reread || mtime != self.search_time || self.scanned_at <= mtime
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.state, DirState::Stopped | DirState::Disabled)
    }

    /// Counts one failure; returns true when the directory just crossed `max_errors`.
    pub fn record_error(&mut self, max_errors: u32) -> bool {
        self.error_counter += 1;
        if self.error_counter >= max_errors && self.state != DirState::Error {
            self.state = DirState::Error;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.error_counter = 0;
        if self.state == DirState::Error {
            self.state = DirState::Idle;
        }
    }

    pub fn record_retrieval(&mut self, now: i64, files: u64, bytes: u64) {
        self.last_retrieval = now;
        self.warned = false;
        self.files_received += files;
        self.bytes_received += bytes;
    }
}

pub type StatusCell = std::sync::Arc<std::sync::Mutex<DirStatus>>;

pub fn lock(cell: &StatusCell) -> std::sync::MutexGuard<'_, DirStatus> {
    cell.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Status cells indexed like the directory table
#[derive(Debug, Default)]
pub struct StatusTable {
    cells: Vec<(u32, StatusCell)>,
}

impl StatusTable {
    pub fn new(directories: &[DirectoryEntry], now: i64) -> Self {
        Self::rebuild(&Self::default(), directories, now)
    }

    /// Status for a new directory table; directories that survived keep their cell.
    pub fn rebuild(previous: &Self, directories: &[DirectoryEntry], now: i64) -> Self {
        let cells = directories
            .iter()
            .map(|dir| {
                let cell = previous.by_id(dir.id).unwrap_or_else(|| {
                    std::sync::Arc::new(std::sync::Mutex::new(DirStatus::new(dir, now)))
                });
                lock(&cell).force_reread = dir.options.force_reread;
                (dir.id, cell)
            })
            .collect();
        Self { cells }
    }

    pub fn get(&self, dir_index: usize) -> Option<&StatusCell> {
        self.cells.get(dir_index).map(|(_, cell)| cell)
    }

    pub fn by_id(&self, dir_id: u32) -> Option<StatusCell> {
        self.cells
            .iter()
            .find(|(id, _)| *id == dir_id)
            .map(|(_, cell)| cell.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StatusCell> {
        self.cells.iter().map(|(_, cell)| cell)
    }

    /// Pulls search times that lie in the future back to `now - 1`.
    ///
    /// Returns how many directories were adjusted.
    pub fn clamp_future(&self, now: i64) -> usize {
        let mut clamped = 0;
        for cell in self.iter() {
            let mut status = lock(cell);
            if status.search_time >= now {
                status.search_time = now - 1;
                clamped += 1;
            }
            if status.scanned_at > now {
                status.scanned_at = now - 1;
            }
            if status.last_retrieval > now {
                status.last_retrieval = now;
            }
        }
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(id: u32) -> DirectoryEntry {
        DirectoryEntry {
            id,
            alias: format!("d{}", id),
            location: common::dirconfig::Location::Local(std::path::PathBuf::from("/tmp")),
            config_id: 0,
            file_groups: vec![],
            options: common::dirconfig::DirOptions::with_defaults(&Default::default()),
        }
    }

    #[test]
    fn crosses_error_threshold_once() {
        let mut status = DirStatus::default();
        assert!(!status.record_error(2));
        assert!(status.record_error(2));
        assert!(!status.record_error(2));
        assert_eq!(status.state, DirState::Error);
        status.record_success();
        assert_eq!(status.state, DirState::Idle);
        assert_eq!(status.error_counter, 0);
    }

    #[test]
    fn same_second_scan_is_repeated() {
        let status = DirStatus {
            search_time: 100,
            scanned_at: 100,
            ..Default::default()
        };
        assert!(status.needs_scan(100));
        assert!(status.needs_scan(101));
        let status = DirStatus {
            scanned_at: 101,
            ..status
        };
        assert!(!status.needs_scan(100));
    }

    #[test]
    fn rebuild_keeps_surviving_cells() {
        let table = StatusTable::new(&[dir(1), dir(2)], 10);
        lock(table.get(1).unwrap()).error_counter = 5;
        let table = StatusTable::rebuild(&table, &[dir(2), dir(3)], 20);
        assert_eq!(lock(table.get(0).unwrap()).error_counter, 5);
        assert_eq!(lock(table.get(1).unwrap()).last_retrieval, 20);
        assert!(table.by_id(1).is_none());
    }

    #[test]
    fn clamps_future_search_times() {
        let table = StatusTable::new(&[dir(1), dir(2)], 10);
        lock(table.get(0).unwrap()).search_time = 5_000;
        lock(table.get(1).unwrap()).search_time = 50;
        assert_eq!(table.clamp_future(100), 1);
        assert_eq!(lock(table.get(0).unwrap()).search_time, 99);
        assert_eq!(lock(table.get(1).unwrap()).search_time, 50);
    }
}
