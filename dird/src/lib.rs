//! Directory monitor of the fdist file distribution daemon
//!
//! `fdist-dird` watches the directories named in the rule files, claims files as they arrive,
//! runs each job's option pipeline in a staging directory and hands the result to the transfer
//! layer through a [`sink::MessageSink`].
//!
//! # Layout of the work directory
//!
//! ```text
//! <work dir>/
//!   job_table.json      compiled tables (and job_table.json.old)
//!   pool/<dir id>/      files claimed from a directory, until linked to their jobs
//!   outgoing/<name>/    one staging directory per job message
//!   time/<job id>/      files of scheduled jobs waiting for their window
//!   queue/<job id>/     files of jobs whose host is paused
//!   spool/<dir id>/     where remote directories are fetched to
//! ```
//!
//! # Commands
//!
//! Single bytes written to the command FIFO: `0x01` shuts down, `0x02` checks all directories
//! now, `0x03` logs exec statistics. Any other byte is fatal.

pub mod clock;
pub mod command;
pub mod daemon;
pub mod scan;
pub mod schedule;
pub mod sink;
pub mod slots;
pub mod status;
pub mod sweep;
pub mod timejobs;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use daemon::{Daemon, DaemonConfig, DaemonError, Summary};
