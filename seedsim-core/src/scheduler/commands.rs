//! Command definitions for the scheduler actor.

use tokio::sync::oneshot;

use crate::SeedSimError;
use crate::profile::SeedingProfile;
use crate::telemetry::TelemetrySnapshot;
use crate::torrent::{InfoHash, ResumeData, TorrentMetadata};

/// Tracker URLs to add to and remove from a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerEdit {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Commands processed by the scheduler actor between ticks.
#[derive(Debug)]
pub enum SchedulerCommand {
    AddTorrent {
        metadata: TorrentMetadata,
        /// None selects the current default profile
        profile: Option<SeedingProfile>,
        resume: ResumeData,
        responder: oneshot::Sender<Result<InfoHash, SeedSimError>>,
    },
    RemoveTorrent {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), SeedSimError>>,
    },
    PauseTorrent {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), SeedSimError>>,
    },
    ResumeTorrent {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), SeedSimError>>,
    },
    ApplyProfile {
        info_hash: InfoHash,
        profile: SeedingProfile,
        responder: oneshot::Sender<Result<(), SeedSimError>>,
    },
    ApplyGlobalProfile {
        profile: SeedingProfile,
        responder: oneshot::Sender<Result<usize, SeedSimError>>,
    },
    EditTrackers {
        info_hash: InfoHash,
        edit: TrackerEdit,
        responder: oneshot::Sender<Result<(), SeedSimError>>,
    },
    Snapshot {
        responder: oneshot::Sender<TelemetrySnapshot>,
    },
    Shutdown {
        responder: oneshot::Sender<()>,
    },
}
