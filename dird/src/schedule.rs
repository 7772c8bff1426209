//! Due times of the periodic steps of one tick
//!
//! Every step runs on multiples of its interval, so a daemon restarted mid-interval stays in
//! phase with its previous run.

/// First multiple of `interval` strictly after `now`.
pub fn next_due(now: i64, interval: std::time::Duration) -> i64 {
    let interval = (interval.as_secs() as i64).max(1);
    now - now.rem_euclid(interval) + interval
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Reread,
    Sweep,
    TimeJobs,
    Check,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    reread_interval: std::time::Duration,
    sweep_interval: std::time::Duration,
    check_interval: std::time::Duration,
    next_reread: i64,
    next_sweep: i64,
    next_time_jobs: i64,
    next_check: i64,
}

impl Schedule {
    /// Everything is due on the first tick.
    pub fn new(config: &common::ScanConfig, now: i64) -> Self {
        Self {
            reread_interval: config.reread_interval,
            sweep_interval: config.sweep_interval,
            check_interval: config.check_interval,
            next_reread: now,
            next_sweep: now,
            next_time_jobs: now,
            next_check: now,
        }
    }

    /// Returns the steps due at `now` and moves each of them to its next slot.
    pub fn take_due(&mut self, now: i64) -> Vec<Step> {
        let mut due = Vec::new();
        if now >= self.next_reread {
            due.push(Step::Reread);
            self.next_reread = next_due(now, self.reread_interval);
        }
        if now >= self.next_sweep {
            due.push(Step::Sweep);
            self.next_sweep = next_due(now, self.sweep_interval);
        }
        if now >= self.next_time_jobs {
            due.push(Step::TimeJobs);
            // schedules have minute resolution
            self.next_time_jobs = next_due(now, std::time::Duration::from_secs(60));
        }
        if now >= self.next_check {
            due.push(Step::Check);
            self.next_check = next_due(now, self.check_interval);
        }
        due
    }

    /// Time left until the earliest step is due.
    pub fn until_next(&self, now: i64) -> std::time::Duration {
        let next = self
            .next_reread
            .min(self.next_sweep)
            .min(self.next_time_jobs)
            .min(self.next_check);
        std::time::Duration::from_secs((next - now).max(0) as u64)
    }

    /// Recomputes every due time from `now`, used after the clock jumped backward.
    pub fn reset(&mut self, now: i64) {
        self.next_reread = next_due(now, self.reread_interval);
        self.next_sweep = next_due(now, self.sweep_interval);
        self.next_time_jobs = next_due(now, std::time::Duration::from_secs(60));
        self.next_check = now;
    }
}
