//! Jobs held until their `time` schedule comes due

use chrono::TimeZone;
use common::dirconfig::{JobEntry, JobTable};

fn next_for(job: &JobEntry, now: i64) -> Option<i64> {
    let local = chrono::Local.timestamp_opt(now, 0).single()?;
    job.schedules
        .iter()
        .filter_map(|schedule| schedule.next_after(&local))
        .map(|time| time.timestamp())
        .min()
}

/// Next due time per scheduled job
#[derive(Debug, Default, Clone)]
pub struct TimeJobs {
    next: std::collections::HashMap<u32, i64>,
}

impl TimeJobs {
    pub fn new(jobs: &JobTable, now: i64) -> Self {
        Self::default().rebuild(jobs, now)
    }

    /// Due times for a new job table; jobs that survived keep theirs.
    pub fn rebuild(&self, jobs: &JobTable, now: i64) -> Self {
        let mut next = std::collections::HashMap::new();
        for job in jobs.iter().filter(|job| !job.schedules.is_empty()) {
            let due = match self.next.get(&job.job_id) {
                Some(due) => Some(*due),
                None => next_for(job, now),
            };
            match due {
                Some(due) => {
                    next.insert(job.job_id, due);
                }
                None => tracing::warn!("job {:08x}: time schedule never fires", job.job_id),
            }
        }
        Self { next }
    }

    /// Indices of the jobs whose window arrived; each moves on to its next window.
    pub fn take_due(&mut self, jobs: &JobTable, now: i64) -> Vec<usize> {
        let mut due = Vec::new();
        for (index, job) in jobs.iter().enumerate() {
            let Some(next) = self.next.get_mut(&job.job_id) else {
                continue;
            };
            if *next > now {
                continue;
            }
            due.push(index);
            match next_for(job, now) {
                Some(following) => *next = following,
                None => {
                    self.next.remove(&job.job_id);
                }
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.next.len()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }
}
