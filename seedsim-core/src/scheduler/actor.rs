//! Actor loop for the session scheduler.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::commands::SchedulerCommand;
use super::core::SessionScheduler;
use super::handle::SchedulerHandle;

const COMMAND_CHANNEL_CAPACITY: usize = 100;

/// Spawns the scheduler on its own task and returns its handle.
///
/// The task ticks at `scheduler.tick_resolution` and processes commands in
/// between ticks, one at a time. It stops after a `Shutdown` command or
/// when every handle has been dropped; the latter also runs a shutdown.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use std::sync::Arc;
/// use std::time::Instant;
///
/// use seedsim_core::config::SeedSimConfig;
/// use seedsim_core::scheduler::{SchedulerDeps, SessionScheduler, spawn_scheduler};
/// use seedsim_core::telemetry::TracingSink;
/// use seedsim_core::tracker::MultiProtocolTrackerClient;
///
/// let config = SeedSimConfig::default();
/// let tracker = Arc::new(MultiProtocolTrackerClient::new(&config.tracker).unwrap());
/// let deps = SchedulerDeps::new(tracker, Arc::new(TracingSink));
/// let scheduler = SessionScheduler::new(config, deps, Instant::now()).unwrap();
/// let handle = spawn_scheduler(scheduler);
/// handle.shutdown().await.unwrap();
/// # }
/// ```
pub fn spawn_scheduler(scheduler: SessionScheduler) -> SchedulerHandle {
    let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    tokio::spawn(run_actor_loop(scheduler, receiver));
    SchedulerHandle::new(sender)
}

async fn run_actor_loop(
    mut scheduler: SessionScheduler,
    mut receiver: mpsc::Receiver<SchedulerCommand>,
) {
    tracing::debug!("Scheduler actor started");
    let mut period = scheduler.tick_resolution();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = receiver.recv() => {
                let Some(command) = command else {
                    scheduler.shutdown(Instant::now()).await;
                    break;
                };
                if !handle_command(&mut scheduler, command).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                scheduler.tick(Instant::now());
                if scheduler.tick_resolution() != period {
                    period = scheduler.tick_resolution();
                    ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    tracing::debug!("Tick resolution changed to {period:?}");
                }
            }
        }
    }

    tracing::debug!("Scheduler actor stopped");
}

/// Handles one command. Returns false once the scheduler has shut down.
async fn handle_command(scheduler: &mut SessionScheduler, command: SchedulerCommand) -> bool {
    let now = Instant::now();
    match command {
        SchedulerCommand::AddTorrent {
            metadata,
            profile,
            resume,
            responder,
        } => {
            let result = scheduler.add_torrent(metadata, profile, resume, now);
            let _ = responder.send(result);
        }

        SchedulerCommand::RemoveTorrent {
            info_hash,
            responder,
        } => {
            let result = scheduler.remove_torrent(&info_hash, now);
            let _ = responder.send(result);
        }

        SchedulerCommand::PauseTorrent {
            info_hash,
            responder,
        } => {
            let result = scheduler.pause_torrent(&info_hash, now);
            let _ = responder.send(result);
        }

        SchedulerCommand::ResumeTorrent {
            info_hash,
            responder,
        } => {
            let result = scheduler.resume_torrent(&info_hash, now);
            let _ = responder.send(result);
        }

        SchedulerCommand::ApplyProfile {
            info_hash,
            profile,
            responder,
        } => {
            let result = scheduler.apply_profile(&info_hash, profile);
            let _ = responder.send(result);
        }

        SchedulerCommand::ApplyGlobalProfile { profile, responder } => {
            let result = scheduler.apply_global_profile(profile);
            let _ = responder.send(result);
        }

        SchedulerCommand::EditTrackers {
            info_hash,
            edit,
            responder,
        } => {
            let result = scheduler.edit_trackers(&info_hash, edit, now);
            let _ = responder.send(result);
        }

        SchedulerCommand::Snapshot { responder } => {
            let _ = responder.send(scheduler.snapshot(now));
        }

        SchedulerCommand::Shutdown { responder } => {
            scheduler.shutdown(now).await;
            let _ = responder.send(());
            return false;
        }
    }
    true
}
