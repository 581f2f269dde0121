//! Shared session state: status, sequence, identity and heartbeat bookkeeping.
//!
//! Only the connection manager writes the status and epoch; the heartbeat
//! controller, the dispatcher and REST calls read them. Check-and-set
//! operations (sequence numbers, heartbeat acks) happen inside one critical
//! section.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Authenticated,
    Ready,
    Reconnecting,
    Closing,
}

/// Identifies one connection epoch. The token is cancelled when the epoch
/// ends, which abandons anything still waiting on it.
#[derive(Debug, Clone)]
pub struct Epoch {
    pub id: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    Accepted,
    /// Equal to or below the last recorded sequence.
    Stale { last: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeInfo {
    pub session_id: String,
    pub resume_token: String,
    pub seq: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    epoch: u64,
    epoch_token: CancellationToken,
    session_id: Option<String>,
    resume_token: Option<String>,
    sequence: Option<u64>,
    heartbeat_interval: Option<Duration>,
    heartbeat_pending: bool,
    heartbeat_sent_at: Option<Instant>,
    latency: Option<Duration>,
}

#[derive(Debug)]
pub struct SessionState {
    inner: RwLock<Inner>,
    status: watch::Sender<ConnectionStatus>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self {
            inner: RwLock::new(Inner {
                epoch: 0,
                epoch_token: token,
                session_id: None,
                resume_token: None,
                sequence: None,
                heartbeat_interval: None,
                heartbeat_pending: false,
                heartbeat_sent_at: None,
                latency: None,
            }),
            status: watch::Sender::new(ConnectionStatus::Disconnected),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            log::debug!("Gateway status {:?} -> {:?}", previous, status);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Waits until the status equals `target`, at most `timeout`.
    pub async fn wait_for_status(&self, target: ConnectionStatus, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .is_ok_and(|changed| changed.is_ok());
        reached
    }

    /// Starts a new epoch and cancels the previous one. Without `resume`
    /// the sequence starts over.
    pub(crate) fn begin_epoch(&self, resume: bool) -> Epoch {
        let mut inner = self.inner.write();
        inner.epoch_token.cancel();
        inner.epoch += 1;
        inner.epoch_token = CancellationToken::new();
        if !resume {
            inner.sequence = None;
        }
        inner.heartbeat_interval = None;
        inner.heartbeat_pending = false;
        inner.heartbeat_sent_at = None;
        Epoch {
            id: inner.epoch,
            token: inner.epoch_token.clone(),
        }
    }

    pub(crate) fn end_epoch(&self) {
        self.inner.read().epoch_token.cancel();
    }

    pub fn epoch(&self) -> Epoch {
        let inner = self.inner.read();
        Epoch {
            id: inner.epoch,
            token: inner.epoch_token.clone(),
        }
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        let inner = self.inner.read();
        inner.epoch == epoch && !inner.epoch_token.is_cancelled()
    }

    /// The epoch to issue a REST call against, or `NotConnected` when the
    /// session is not `Ready`.
    pub fn require_ready(&self) -> Result<Epoch, ClientError> {
        if self.status() != ConnectionStatus::Ready {
            return Err(ClientError::NotConnected);
        }
        let epoch = self.epoch();
        if epoch.token.is_cancelled() {
            return Err(ClientError::NotConnected);
        }
        Ok(epoch)
    }

    /// Records `seq` if it is above the last one seen.
    pub(crate) fn observe_sequence(&self, seq: u64) -> SequenceCheck {
        let mut inner = self.inner.write();
        match inner.sequence {
            Some(last) if seq <= last => SequenceCheck::Stale { last },
            _ => {
                inner.sequence = Some(seq);
                SequenceCheck::Accepted
            }
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        self.inner.read().sequence
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.read().session_id.clone()
    }

    pub(crate) fn mark_identified(&self, session_id: String, resume_token: Option<String>) {
        let mut inner = self.inner.write();
        inner.resume_token = Some(resume_token.unwrap_or_else(|| session_id.clone()));
        inner.session_id = Some(session_id);
    }

    pub fn resume_info(&self) -> Option<ResumeInfo> {
        let inner = self.inner.read();
        Some(ResumeInfo {
            session_id: inner.session_id.clone()?,
            resume_token: inner.resume_token.clone()?,
            seq: inner.sequence,
        })
    }

    pub(crate) fn clear_resume(&self) {
        let mut inner = self.inner.write();
        inner.session_id = None;
        inner.resume_token = None;
    }

    /// Fixes the heartbeat interval for the current epoch. Returns `false`
    /// if it was already set.
    pub(crate) fn set_heartbeat_interval(&self, interval: Duration) -> bool {
        let mut inner = self.inner.write();
        if inner.heartbeat_interval.is_some() {
            return false;
        }
        inner.heartbeat_interval = Some(interval);
        true
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.inner.read().heartbeat_interval
    }

    /// Whether the last heartbeat sent is still waiting for its ack.
    pub fn heartbeat_pending(&self) -> bool {
        self.inner.read().heartbeat_pending
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        let mut inner = self.inner.write();
        inner.heartbeat_pending = true;
        inner.heartbeat_sent_at = Some(Instant::now());
    }

    pub(crate) fn record_heartbeat_ack(&self) -> Option<Duration> {
        let mut inner = self.inner.write();
        inner.heartbeat_pending = false;
        let latency = inner.heartbeat_sent_at.take().map(|sent| sent.elapsed());
        if latency.is_some() {
            inner.latency = latency;
        }
        latency
    }

    /// Round trip of the most recent acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.inner.read().latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_strictly_increasing() {
        let session = SessionState::new();
        assert_eq!(session.observe_sequence(1), SequenceCheck::Accepted);
        assert_eq!(session.observe_sequence(2), SequenceCheck::Accepted);
        assert_eq!(session.observe_sequence(2), SequenceCheck::Stale { last: 2 });
        assert_eq!(session.observe_sequence(1), SequenceCheck::Stale { last: 2 });
        assert_eq!(session.observe_sequence(5), SequenceCheck::Accepted);
        assert_eq!(session.sequence(), Some(5));
    }

    #[test]
    fn new_epoch_resets_sequence_unless_resuming() {
        let session = SessionState::new();
        session.begin_epoch(false);
        session.observe_sequence(10);

        session.begin_epoch(true);
        assert_eq!(session.sequence(), Some(10));

        session.begin_epoch(false);
        assert_eq!(session.sequence(), None);
    }

    #[test]
    fn begin_epoch_cancels_previous_token() {
        let session = SessionState::new();
        let first = session.begin_epoch(false);
        let second = session.begin_epoch(false);

        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert!(!session.is_current(first.id));
        assert!(session.is_current(second.id));
    }

    #[test]
    fn require_ready_fails_fast_when_not_ready() {
        let session = SessionState::new();
        session.begin_epoch(false);
        session.set_status(ConnectionStatus::Authenticated);
        assert!(matches!(session.require_ready(), Err(ClientError::NotConnected)));

        session.set_status(ConnectionStatus::Ready);
        assert!(session.require_ready().is_ok());
    }

    #[test]
    fn heartbeat_interval_is_fixed_per_epoch() {
        let session = SessionState::new();
        session.begin_epoch(false);
        assert!(session.set_heartbeat_interval(Duration::from_secs(30)));
        assert!(!session.set_heartbeat_interval(Duration::from_secs(5)));
        assert_eq!(session.heartbeat_interval(), Some(Duration::from_secs(30)));

        session.begin_epoch(true);
        assert_eq!(session.heartbeat_interval(), None);
    }

    #[test]
    fn resume_token_defaults_to_session_id() {
        let session = SessionState::new();
        assert!(session.resume_info().is_none());

        session.mark_identified("abc".into(), None);
        session.observe_sequence(3);
        let info = session.resume_info().unwrap();
        assert_eq!(info.resume_token, "abc");
        assert_eq!(info.seq, Some(3));

        session.clear_resume();
        assert!(session.resume_info().is_none());
    }

    #[tokio::test]
    async fn ack_clears_pending_heartbeat() {
        let session = SessionState::new();
        session.record_heartbeat_sent();
        assert!(session.heartbeat_pending());
        assert!(session.record_heartbeat_ack().is_some());
        assert!(!session.heartbeat_pending());
        assert!(session.latency().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_status_sees_later_change_and_times_out() {
        let session = std::sync::Arc::new(SessionState::new());
        let setter = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            setter.set_status(ConnectionStatus::Ready);
        });

        assert!(session.wait_for_status(ConnectionStatus::Ready, Duration::from_secs(1)).await);
        assert!(!session.wait_for_status(ConnectionStatus::Closing, Duration::from_secs(1)).await);
    }
}
