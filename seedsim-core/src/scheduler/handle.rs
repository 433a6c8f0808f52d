//! Handle for communicating with the scheduler actor.

use tokio::sync::{mpsc, oneshot};

use super::SchedulerError;
use super::commands::{SchedulerCommand, TrackerEdit};
use crate::SeedSimError;
use crate::profile::SeedingProfile;
use crate::telemetry::TelemetrySnapshot;
use crate::torrent::{InfoHash, ResumeData, TorrentMetadata};

/// Cloneable async front end of a running scheduler.
///
/// Every method fails with `SchedulerError::Shutdown` once the actor has
/// stopped.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn new(sender: mpsc::Sender<SchedulerCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        command: SchedulerCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, SeedSimError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SchedulerError::Shutdown)?;
        rx.await.map_err(|_| SchedulerError::Shutdown.into())
    }

    /// Starts seeding a torrent. It becomes active on the next tick.
    ///
    /// # Errors
    /// - `SchedulerError::DuplicateTorrent` - Already seeding this info hash
    /// - `ConfigurationError` - Invalid profile
    pub async fn add_torrent(
        &self,
        metadata: TorrentMetadata,
        profile: Option<SeedingProfile>,
        resume: ResumeData,
    ) -> Result<InfoHash, SeedSimError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SchedulerCommand::AddTorrent {
            metadata,
            profile,
            resume,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// Stops seeding, announcing `stopped` where allowed.
    ///
    /// # Errors
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    pub async fn remove_torrent(&self, info_hash: InfoHash) -> Result<(), SeedSimError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SchedulerCommand::RemoveTorrent {
            info_hash,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// # Errors
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `SchedulerError::InvalidState` - Session not active
    pub async fn pause_torrent(&self, info_hash: InfoHash) -> Result<(), SeedSimError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SchedulerCommand::PauseTorrent {
            info_hash,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// # Errors
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `SchedulerError::InvalidState` - Session not paused or errored
    pub async fn resume_torrent(&self, info_hash: InfoHash) -> Result<(), SeedSimError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SchedulerCommand::ResumeTorrent {
            info_hash,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// Switches one session's profile without closing connections.
    ///
    /// # Errors
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `ConfigurationError` - Invalid profile; nothing changed
    pub async fn apply_profile(
        &self,
        info_hash: InfoHash,
        profile: SeedingProfile,
    ) -> Result<(), SeedSimError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SchedulerCommand::ApplyProfile {
            info_hash,
            profile,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// Switches every session's profile and the default for new sessions.
    /// Returns the number of sessions changed.
    ///
    /// # Errors
    /// - `ConfigurationError` - Invalid profile; nothing changed
    pub async fn apply_global_profile(&self, profile: SeedingProfile) -> Result<usize, SeedSimError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SchedulerCommand::ApplyGlobalProfile { profile, responder };
        self.request(cmd, rx).await?
    }

    /// # Errors
    /// - `SchedulerError::TorrentNotFound` - Unknown info hash
    /// - `TrackerError::InvalidUrl` - An added URL is unusable; nothing changed
    pub async fn edit_trackers(
        &self,
        info_hash: InfoHash,
        edit: TrackerEdit,
    ) -> Result<(), SeedSimError> {
        let (responder, rx) = oneshot::channel();
        let cmd = SchedulerCommand::EditTrackers {
            info_hash,
            edit,
            responder,
        };
        self.request(cmd, rx).await?
    }

    /// Current statistics for every session.
    pub async fn snapshot(&self) -> Result<TelemetrySnapshot, SeedSimError> {
        let (responder, rx) = oneshot::channel();
        self.request(SchedulerCommand::Snapshot { responder }, rx)
            .await
    }

    /// Shuts the scheduler down and waits for it to finish.
    pub async fn shutdown(&self) -> Result<(), SeedSimError> {
        let (responder, rx) = oneshot::channel();
        self.request(SchedulerCommand::Shutdown { responder }, rx)
            .await
    }

    /// Checks if the actor is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::config::SeedSimConfig;
    use crate::scheduler::{SchedulerDeps, SessionScheduler, spawn_scheduler};
    use crate::telemetry::ChannelSink;
    use crate::torrent::SessionState;
    use crate::tracker::test_mocks::MockTrackerClient;

    fn metadata() -> TorrentMetadata {
        TorrentMetadata::new(
            InfoHash::new([0x11; 20]),
            "handle",
            16384,
            16384 * 4,
            vec![vec!["http://tracker.example/announce".to_string()]],
        )
        .unwrap()
    }

    fn spawn() -> (SchedulerHandle, Arc<MockTrackerClient>) {
        let tracker = Arc::new(MockTrackerClient::with_interval(1800));
        let (sink, _snapshots) = ChannelSink::new();
        let scheduler = SessionScheduler::new(
            SeedSimConfig::for_testing(),
            SchedulerDeps::new(tracker.clone(), Arc::new(sink)),
            Instant::now(),
        )
        .unwrap();
        (spawn_scheduler(scheduler), tracker)
    }

    #[tokio::test]
    async fn test_add_then_snapshot_after_tick() {
        let (handle, tracker) = spawn();
        let info_hash = handle
            .add_torrent(metadata(), None, ResumeData::default())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let snapshot = handle.snapshot().await.unwrap();
        let torrent = snapshot.torrent(&info_hash.to_string()).unwrap();
        assert_eq!(torrent.state, SessionState::Active);
        assert_eq!(tracker.announce_count(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let (handle, _tracker) = spawn();
        handle.shutdown().await.unwrap();

        let result = handle.snapshot().await;
        assert!(matches!(
            result,
            Err(SeedSimError::Scheduler(SchedulerError::Shutdown))
        ));
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_pause_unknown_torrent() {
        let (handle, _tracker) = spawn();
        let result = handle.pause_torrent(InfoHash::new([0xee; 20])).await;
        assert!(matches!(
            result,
            Err(SeedSimError::Scheduler(SchedulerError::TorrentNotFound { .. }))
        ));
        handle.shutdown().await.unwrap();
    }
}
