//! Bookkeeping of live worker tasks
//!
//! Only the dispatcher touches the slot table. Workers report back over a channel with a
//! [`WorkerCompletion`]; a worker that died without reporting is found by [`WorkerSlots::reap`].

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Done,
    Cancelled,
    Failed(String),
}

/// Sent by a worker as its last action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCompletion {
    pub worker_id: usize,
    /// of the slot the worker was attached to
    pub generation: u64,
    pub dir_id: u32,
    pub report: crate::scan::ChunkReport,
    pub outcome: WorkerOutcome,
}

#[derive(Debug)]
pub struct Slot {
    pub dir_id: u32,
    pub generation: u64,
    pub handle: tokio::task::JoinHandle<()>,
}

/// Fixed-size table of worker id to slot
#[derive(Debug)]
pub struct WorkerSlots {
    slots: Vec<Option<Slot>>,
    generation: u64,
}

impl WorkerSlots {
    pub fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            generation: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn live_for(&self, dir_id: u32) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.dir_id == dir_id)
            .count()
    }

    /// Free slots usable by a directory allowing `dir_max` workers.
    pub fn available_for(&self, dir_id: u32, dir_max: usize) -> usize {
        let global = self.capacity() - self.live();
        let local = dir_max.saturating_sub(self.live_for(dir_id));
        global.min(local)
    }

    /// Picks a free slot id and the generation its next worker reports with.
    ///
    /// The task is attached with [`WorkerSlots::attach`].
    pub fn reserve(&mut self) -> Option<(usize, u64)> {
        let worker_id = self.slots.iter().position(Option::is_none)?;
        self.generation += 1;
        Some((worker_id, self.generation))
    }

    pub fn attach(
        &mut self,
        worker_id: usize,
        generation: u64,
        dir_id: u32,
        handle: tokio::task::JoinHandle<()>,
    ) {
        if let Some(slot) = self.slots.get_mut(worker_id) {
            *slot = Some(Slot {
                dir_id,
                generation,
                handle,
            });
        }
    }

    /// Frees the slot of a completed worker.
    ///
    /// A completion arriving after [`WorkerSlots::reap`] already took its slot finds the slot
    /// empty or owned by a newer worker, and releases nothing.
    pub fn release(&mut self, worker_id: usize, generation: u64) -> Option<Slot> {
        let entry = self.slots.get_mut(worker_id)?;
        if entry.as_ref()?.generation != generation {
            return None;
        }
        entry.take()
    }

    /// Frees slots whose task ended.
    ///
    /// A worker that panicked or was aborted shows up with an `Err`. An `Ok` means its completion
    /// is still in the channel.
    pub async fn reap(&mut self) -> Vec<(usize, u32, Result<(), tokio::task::JoinError>)> {
        let mut reaped = Vec::new();
        for (worker_id, entry) in self.slots.iter_mut().enumerate() {
            if entry
                .as_ref()
                .is_some_and(|slot| slot.handle.is_finished())
                && let Some(slot) = entry.take()
            {
                reaped.push((worker_id, slot.dir_id, slot.handle.await));
            }
        }
        reaped
    }

    /// Waits for every live worker.
    pub async fn join_all(&mut self) -> Vec<(usize, u32, Result<(), tokio::task::JoinError>)> {
        let mut joined = Vec::new();
        for (worker_id, entry) in self.slots.iter_mut().enumerate() {
            if let Some(slot) = entry.take() {
                joined.push((worker_id, slot.dir_id, slot.handle.await));
            }
        }
        joined
    }
}
