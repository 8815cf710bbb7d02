//! Per-session announce scheduling.
//!
//! One announcer task runs per active session. Announces for a torrent are
//! strictly sequential: the next one starts only after the previous one has
//! returned or timed out. Failures back off exponentially; successes wait
//! for the tracker's interval, never less than the configured minimum.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerManagement};
use crate::config::TrackerConfig;
use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Counters reported with every announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// What the announcer tells its session.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnounceOutcome {
    /// A tracker answered; `peers` may be empty.
    Peers(Vec<SocketAddr>),
    /// Every tracker failed; the next round runs after `retry_in`.
    Failed { reason: String, retry_in: Duration },
}

enum AnnouncerCommand {
    Completed,
    Stop(oneshot::Sender<()>),
}

/// Identity and counters the announcer reports to trackers.
#[derive(Debug, Clone)]
pub struct AnnounceIdentity {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
}

/// Announce loop for one torrent.
pub struct Announcer<T> {
    trackers: T,
    identity: AnnounceIdentity,
    config: TrackerConfig,
    totals: watch::Receiver<TransferTotals>,
    commands: mpsc::Receiver<AnnouncerCommand>,
    outcomes: mpsc::Sender<AnnounceOutcome>,
    started: bool,
    completion_pending: bool,
}

/// Control side of a running announcer.
pub struct AnnouncerHandle {
    commands: mpsc::Sender<AnnouncerCommand>,
    task: JoinHandle<()>,
}

enum Interrupt {
    Stop(Option<oneshot::Sender<()>>),
}

impl<T: TrackerManagement + 'static> Announcer<T> {
    /// Spawns the announce loop; the first announce carries `started`.
    pub fn spawn(
        trackers: T,
        identity: AnnounceIdentity,
        config: TrackerConfig,
        totals: watch::Receiver<TransferTotals>,
        outcomes: mpsc::Sender<AnnounceOutcome>,
    ) -> AnnouncerHandle {
        let (command_tx, command_rx) = mpsc::channel(8);
        let announcer = Self {
            trackers,
            identity,
            config,
            totals,
            commands: command_rx,
            outcomes,
            started: false,
            completion_pending: false,
        };
        let task = tokio::spawn(announcer.run());
        AnnouncerHandle {
            commands: command_tx,
            task,
        }
    }

    async fn run(mut self) {
        if self.trackers.is_empty() {
            tracing::info!(
                "Torrent {} has no usable trackers; waiting for incoming peers",
                self.identity.info_hash
            );
            let ack = self.wait_for_stop().await;
            Self::acknowledge(ack);
            return;
        }

        let mut failures: u32 = 0;
        loop {
            let event = if !self.started {
                AnnounceEvent::Started
            } else if self.completion_pending {
                AnnounceEvent::Completed
            } else {
                AnnounceEvent::Regular
            };

            let result = match self.announce_interruptible(event).await {
                Ok(result) => result,
                Err(Interrupt::Stop(ack)) => return self.shut_down(ack).await,
            };

            let wait = match result {
                Ok(response) => {
                    failures = 0;
                    self.started = true;
                    if event == AnnounceEvent::Completed {
                        self.completion_pending = false;
                    }
                    if !self.publish(AnnounceOutcome::Peers(response.peers)) {
                        return;
                    }

                    if self.completion_pending {
                        Duration::ZERO
                    } else {
                        self.next_interval(response.interval, response.min_interval)
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let retry_in = self.retry_delay(failures);
                    tracing::warn!(
                        "Announce for {} failed ({} in a row), retrying in {:?}: {}",
                        self.identity.info_hash,
                        failures,
                        retry_in,
                        e
                    );
                    let outcome = AnnounceOutcome::Failed {
                        reason: e.to_string(),
                        retry_in,
                    };
                    if !self.publish(outcome) {
                        return;
                    }
                    retry_in
                }
            };

            if let Err(Interrupt::Stop(ack)) = self.sleep_interruptible(wait).await {
                return self.shut_down(ack).await;
            }
        }
    }

    async fn announce_interruptible(
        &mut self,
        event: AnnounceEvent,
    ) -> Result<Result<AnnounceResponse, TorrentError>, Interrupt> {
        let request = self.request(event);
        let announce = self.trackers.announce(request);
        tokio::pin!(announce);

        loop {
            tokio::select! {
                result = &mut announce => return Ok(result),
                command = self.commands.recv() => match command {
                    Some(AnnouncerCommand::Completed) => self.completion_pending = true,
                    Some(AnnouncerCommand::Stop(ack)) => return Err(Interrupt::Stop(Some(ack))),
                    None => return Err(Interrupt::Stop(None)),
                },
            }
        }
    }

    async fn sleep_interruptible(&mut self, wait: Duration) -> Result<(), Interrupt> {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Ok(()),
                command = self.commands.recv() => match command {
                    Some(AnnouncerCommand::Completed) => {
                        self.completion_pending = true;
                        if self.started {
                            return Ok(());
                        }
                    }
                    Some(AnnouncerCommand::Stop(ack)) => return Err(Interrupt::Stop(Some(ack))),
                    None => return Err(Interrupt::Stop(None)),
                },
            }
        }
    }

    async fn wait_for_stop(&mut self) -> Option<oneshot::Sender<()>> {
        loop {
            match self.commands.recv().await {
                Some(AnnouncerCommand::Completed) => {}
                Some(AnnouncerCommand::Stop(ack)) => return Some(ack),
                None => return None,
            }
        }
    }

    /// Best-effort `stopped` announce, bounded by the stop timeout.
    async fn shut_down(mut self, ack: Option<oneshot::Sender<()>>) {
        if self.started {
            let request = self.request(AnnounceEvent::Stopped);
            match tokio::time::timeout(self.config.stop_timeout, self.trackers.announce(request))
                .await
            {
                Ok(Ok(_)) => tracing::debug!("Sent stopped for {}", self.identity.info_hash),
                Ok(Err(e)) => tracing::debug!("Stopped announce failed: {}", e),
                Err(_) => tracing::debug!("Stopped announce timed out"),
            }
        }
        Self::acknowledge(ack);
    }

    /// Returns false once the session has gone away.
    fn publish(&self, outcome: AnnounceOutcome) -> bool {
        match self.outcomes.try_send(outcome) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Session busy; announce outcome dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn acknowledge(ack: Option<oneshot::Sender<()>>) {
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let totals = *self.totals.borrow();
        AnnounceRequest {
            info_hash: self.identity.info_hash,
            peer_id: self.identity.peer_id,
            port: self.identity.port,
            uploaded: totals.uploaded,
            downloaded: totals.downloaded,
            left: totals.left,
            event,
            numwant: if event == AnnounceEvent::Stopped {
                0
            } else {
                self.config.numwant
            },
        }
    }

    fn next_interval(&self, interval: u32, min_interval: Option<u32>) -> Duration {
        let tracker_floor = Duration::from_secs(u64::from(min_interval.unwrap_or(0)));
        Duration::from_secs(u64::from(interval))
            .max(tracker_floor)
            .max(self.config.min_announce_interval)
    }

    fn retry_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.config
            .retry_base
            .saturating_mul(1u32 << exponent)
            .min(self.config.retry_cap)
    }
}

impl AnnouncerHandle {
    /// Queues a `completed` announce.
    pub fn completed(&self) {
        if self.commands.try_send(AnnouncerCommand::Completed).is_err() {
            tracing::debug!("Announcer gone or busy; completed event dropped");
        }
    }

    /// Stops the loop after a best-effort `stopped` announce.
    pub async fn stop(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(AnnouncerCommand::Stop(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        let _ = self.task.await;
    }

    /// Cancels the loop without a `stopped` announce.
    pub fn abort(self) {
        self.task.abort();
    }
}
