//! Session scheduler.
//!
//! [`SessionScheduler`] owns every [`TorrentSession`](crate::torrent::TorrentSession)
//! and drives all time-based behavior from one cooperative tick. Network work
//! (announces, scrapes, DHT lookups) runs on a bounded worker pool and its
//! results are applied on a later tick. [`spawn_scheduler`] runs it as an
//! actor behind a cloneable [`SchedulerHandle`].

pub mod actor;
pub mod commands;
pub mod core;
pub mod handle;

pub use actor::spawn_scheduler;
pub use commands::{SchedulerCommand, TrackerEdit};
pub use self::core::{SchedulerDeps, SessionScheduler, TickSummary};
pub use handle::SchedulerHandle;

use crate::torrent::InfoHash;

/// Errors from scheduler commands.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Torrent {info_hash} is already being seeded")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} cannot {action} while {state}")]
    InvalidState {
        info_hash: InfoHash,
        action: &'static str,
        state: String,
    },

    #[error("Scheduler has shut down")]
    Shutdown,
}
