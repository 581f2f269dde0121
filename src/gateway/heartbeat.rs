//! Heartbeat keep-alive and liveness detection.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};

use super::codec::Frame;
use super::session::{Epoch, SessionState};
use super::transport::GatewayWriter;

/// Why the heartbeat loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Too many heartbeats went unacknowledged; the connection is dead.
    MissedAck { missed: u32 },
    /// Writing the heartbeat failed.
    WriteFailed(String),
    /// The epoch ended.
    Cancelled,
}

pub(crate) struct Heartbeat {
    pub(crate) interval: Duration,
    /// `None`: the ack must arrive before the next tick.
    pub(crate) ack_timeout: Option<Duration>,
    pub(crate) missed_limit: u32,
}

impl Heartbeat {
    /// Sends one heartbeat per `interval` until the epoch is cancelled or
    /// the peer stops acknowledging.
    ///
    /// The first heartbeat goes out one interval after start. On every tick
    /// the previous heartbeat must have been acked, otherwise it counts as
    /// missed; `missed_limit` consecutive misses end the loop.
    pub(crate) async fn run(
        self,
        session: Arc<SessionState>,
        writer: Arc<GatewayWriter>,
        epoch: Epoch,
    ) -> HeartbeatOutcome {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missed: u32 = 0;
        let mut ack_deadline: Option<Instant> = None;

        loop {
            let ack_wait = async {
                match ack_deadline {
                    Some(deadline) => time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                () = epoch.token.cancelled() => return HeartbeatOutcome::Cancelled,

                () = ack_wait => {
                    ack_deadline = None;
                    if session.heartbeat_pending() {
                        missed += 1;
                        log::warn!(
                            "Heartbeat ack not received within {:?} ({} missed)",
                            self.ack_timeout.unwrap_or(self.interval),
                            missed
                        );
                        if missed >= self.missed_limit {
                            return HeartbeatOutcome::MissedAck { missed };
                        }
                    }
                }

                _ = ticker.tick() => {
                    if self.ack_timeout.is_none() && session.heartbeat_pending() {
                        missed += 1;
                        log::warn!("Heartbeat not acknowledged before next tick ({} missed)", missed);
                        if missed >= self.missed_limit {
                            return HeartbeatOutcome::MissedAck { missed };
                        }
                    } else if !session.heartbeat_pending() {
                        missed = 0;
                    }

                    // Marked before the write so an ack racing the send is not lost.
                    session.record_heartbeat_sent();
                    let frame = Frame::heartbeat(session.sequence());
                    if let Err(e) = writer.send(epoch.id, &frame).await {
                        if epoch.token.is_cancelled() {
                            return HeartbeatOutcome::Cancelled;
                        }
                        return HeartbeatOutcome::WriteFailed(e.to_string());
                    }
                    ack_deadline = self
                        .ack_timeout
                        .map(|timeout| Instant::now() + timeout.min(self.interval));
                }
            }
        }
    }
}
