//! The connection manager: connect, authenticate, read, reconnect, close.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticated -> Ready
//!       ^             ^                            |
//!       |             +------- Reconnecting <------+  (any failure)
//!       +---------------------- Closing  <------------ (close())
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::codec::{self, Frame, Opcode};
use super::dispatcher::EventDispatcher;
use super::heartbeat::{Heartbeat, HeartbeatOutcome};
use super::session::{ConnectionStatus, Epoch, SessionState};
use super::transport::{Connector, FrameStream, GatewayWriter};
use crate::cache::Cache;
use crate::client::Context;
use crate::config::GatewayConfig;
use crate::error::ClientError;
use crate::event::names;
use crate::model::Ready;

/// Close code the gateway uses for rejected credentials.
pub const CLOSE_AUTHENTICATION_FAILED: u16 = 4004;

/// Interval used when neither the Hello frame nor the config provide one.
const FALLBACK_HEARTBEAT: Duration = Duration::from_millis(30_000);

#[derive(Debug)]
enum EpochEnd {
    Shutdown,
    Reconnect(String),
}

pub(crate) struct Gateway {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) session: Arc<SessionState>,
    pub(crate) cache: Arc<Cache>,
    pub(crate) writer: Arc<GatewayWriter>,
    pub(crate) shutdown: CancellationToken,
}

/// Puts the session back to `Disconnected` however `run` is left.
struct DisconnectGuard<'a>(&'a SessionState);

impl Drop for DisconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.end_epoch();
        self.0.set_status(ConnectionStatus::Disconnected);
    }
}

impl Gateway {
    /// Keeps a session alive until `shutdown` fires or a fatal error occurs.
    ///
    /// With `initial_must_succeed` the first connection has to reach `Ready`;
    /// its failure is returned instead of retried.
    pub(crate) async fn run(
        &self,
        token: &str,
        dispatcher: &EventDispatcher,
        ctx: &Context,
        initial_must_succeed: bool,
    ) -> Result<(), ClientError> {
        let _guard = DisconnectGuard(&self.session);
        let backoff = Backoff::new(self.config.backoff);
        let mut attempt: u32 = 0;
        let mut ever_ready = false;

        let result = loop {
            let mut reached_ready = false;
            let end = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => Ok(EpochEnd::Shutdown),
                end = self.run_epoch(token, dispatcher, ctx, &mut reached_ready) => end,
            };
            if reached_ready {
                attempt = 0;
                ever_ready = true;
            }

            let failure = match end {
                Ok(EpochEnd::Shutdown) => {
                    log::info!("Closing gateway connection");
                    self.session.set_status(ConnectionStatus::Closing);
                    self.session.end_epoch();
                    self.writer.close(self.config.close_timeout).await;
                    break Ok(());
                }
                Ok(EpochEnd::Reconnect(reason)) => {
                    log::info!("Gateway connection ended: {}", reason);
                    ClientError::ConnectionClosed
                }
                Err(e) if e.is_fatal() => {
                    log::error!("Gateway session failed: {}", e);
                    break Err(e);
                }
                Err(e) => {
                    log::warn!("Gateway connection lost: {}", e);
                    e
                }
            };

            self.session.set_status(ConnectionStatus::Reconnecting);
            self.session.end_epoch();
            self.writer.detach().await;

            if initial_must_succeed && !ever_ready {
                break Err(failure);
            }

            attempt += 1;
            let max = self.config.max_reconnect_attempts;
            if max > 0 && attempt > max {
                log::error!("Giving up after {} reconnect attempts", max);
                break Err(ClientError::ReconnectLimit(max));
            }

            let delay = backoff.delay(attempt);
            log::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break Ok(()),
                () = time::sleep(delay) => {}
            }
        };

        self.writer.detach().await;
        result
    }

    async fn run_epoch(
        &self,
        token: &str,
        dispatcher: &EventDispatcher,
        ctx: &Context,
        reached_ready: &mut bool,
    ) -> Result<EpochEnd, ClientError> {
        self.session.set_status(ConnectionStatus::Connecting);
        let resume = self.session.resume_info();
        let epoch = self.session.begin_epoch(resume.is_some());
        log::info!(
            "Connecting to {} (epoch {}, {})",
            self.config.gateway_url,
            epoch.id,
            if resume.is_some() { "resuming" } else { "identifying" }
        );

        let (sink, mut stream) = time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config.gateway_url),
        )
        .await
        .map_err(|_| ClientError::Timeout("gateway connect"))??;
        self.writer.attach(epoch.id, sink).await;

        // Stops the heartbeat however this epoch ends.
        let _epoch_guard = epoch.token.clone().drop_guard();

        let hello = time::timeout(self.config.ready_timeout, wait_for_hello(&mut stream))
            .await
            .map_err(|_| ClientError::Timeout("hello"))??;
        let interval = self
            .config
            .heartbeat_interval
            .or_else(|| hello.heartbeat_interval())
            .unwrap_or(FALLBACK_HEARTBEAT);
        self.session.set_heartbeat_interval(interval);
        log::debug!("Hello received, heartbeat every {:?}", interval);

        let mut heartbeat = tokio::spawn(
            Heartbeat {
                interval,
                ack_timeout: self.config.heartbeat_ack_timeout,
                missed_limit: self.config.missed_heartbeat_limit,
            }
            .run(self.session.clone(), self.writer.clone(), epoch.clone()),
        );

        let identifying = match &resume {
            Some(info) => {
                let frame = Frame::resume(token, &info.session_id, &info.resume_token, info.seq);
                self.writer.send(epoch.id, &frame).await?;
                false
            }
            None => {
                self.writer.send(epoch.id, &Frame::identify(token)).await?;
                true
            }
        };
        self.session.set_status(ConnectionStatus::Authenticated);

        let ready_deadline = Instant::now() + self.config.ready_timeout;
        loop {
            tokio::select! {
                biased;

                outcome = &mut heartbeat => {
                    let reason = match outcome.unwrap_or(HeartbeatOutcome::Cancelled) {
                        HeartbeatOutcome::MissedAck { missed } => {
                            format!("{} heartbeat(s) went unacknowledged", missed)
                        }
                        HeartbeatOutcome::WriteFailed(e) => format!("heartbeat write failed: {}", e),
                        HeartbeatOutcome::Cancelled => "heartbeat stopped".to_string(),
                    };
                    return Ok(EpochEnd::Reconnect(reason));
                }

                () = time::sleep_until(ready_deadline), if !*reached_ready => {
                    if !identifying {
                        log::warn!("Resume was not confirmed, identifying from scratch next time");
                        self.session.clear_resume();
                    }
                    return Err(ClientError::Timeout("ready"));
                }

                frame = next_frame(&mut stream) => {
                    let frame = frame?;
                    if let Some(end) = self
                        .handle_frame(frame, &epoch, identifying, dispatcher, ctx, reached_ready)
                        .await?
                    {
                        return Ok(end);
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        frame: Frame,
        epoch: &Epoch,
        identifying: bool,
        dispatcher: &EventDispatcher,
        ctx: &Context,
        reached_ready: &mut bool,
    ) -> Result<Option<EpochEnd>, ClientError> {
        match frame.op {
            Opcode::Dispatch => {
                // Replays must not touch the session or the cache.
                if dispatcher.admit(&frame).is_some() {
                    return Ok(None);
                }
                let event = frame.event.as_deref().unwrap_or_default();
                if names::is_ready(event) {
                    self.record_ready(&frame);
                } else {
                    self.cache.apply(event, &frame.data);
                }
                if names::is_ready(event) || names::is_resumed(event) {
                    *reached_ready = true;
                    self.session.set_status(ConnectionStatus::Ready);
                    log::info!("Gateway ready (epoch {})", epoch.id);
                }
                dispatcher.schedule(frame, ctx);
            }
            Opcode::Heartbeat => {
                self.session.record_heartbeat_sent();
                self.writer
                    .send(epoch.id, &Frame::heartbeat(self.session.sequence()))
                    .await?;
            }
            Opcode::HeartbeatAck => {
                if let Some(latency) = self.session.record_heartbeat_ack() {
                    log::debug!("Heartbeat acknowledged after {:?}", latency);
                }
            }
            Opcode::Reconnect => {
                return Ok(Some(EpochEnd::Reconnect("server requested a reconnect".into())));
            }
            Opcode::InvalidSession => {
                let resumable = frame.data.as_bool().unwrap_or(false);
                if identifying && !resumable {
                    return Err(ClientError::Auth("gateway rejected the identify".into()));
                }
                if !resumable {
                    self.session.clear_resume();
                }
                return Ok(Some(EpochEnd::Reconnect("session invalidated".into())));
            }
            Opcode::Close => {
                return Ok(Some(EpochEnd::Reconnect("server closed the session".into())));
            }
            Opcode::Hello => {
                log::warn!("Ignoring repeated Hello; the heartbeat interval is fixed for this connection");
            }
            Opcode::Identify | Opcode::Resume => {
                log::debug!("Ignoring client-only opcode {:?} from server", frame.op);
            }
        }
        Ok(None)
    }

    fn record_ready(&self, frame: &Frame) {
        let ready = match serde_json::from_value::<Ready>(frame.data.clone()) {
            Ok(ready) => ready,
            Err(e) => {
                log::warn!("Could not read ready payload ({}); reconnects will re-identify", e);
                self.session.clear_resume();
                return;
            }
        };

        self.cache.load_ready(&ready);
        match ready.session_id {
            Some(session_id) => self.session.mark_identified(session_id, ready.resume_token),
            None => {
                log::warn!("Ready payload has no session id; reconnects will re-identify");
                self.session.clear_resume();
            }
        }
    }
}

async fn wait_for_hello(stream: &mut FrameStream) -> Result<Frame, ClientError> {
    loop {
        let frame = next_frame(stream).await?;
        if frame.op == Opcode::Hello {
            return Ok(frame);
        }
        log::debug!("Ignoring {:?} before Hello", frame.op);
    }
}

/// Next decodable frame. Undecodable ones are logged and skipped.
async fn next_frame(stream: &mut FrameStream) -> Result<Frame, ClientError> {
    loop {
        let msg = stream.next().await.ok_or(ClientError::ConnectionClosed)??;
        let decoded = match &msg {
            WsMessage::Text(text) => codec::decode_text(text.as_str()),
            WsMessage::Binary(bytes) => codec::decode(bytes),
            WsMessage::Close(frame) => return Err(close_error(frame.as_ref())),
            _ => continue,
        };
        match decoded {
            Ok(Some(frame)) => {
                log::debug!("Received {:?} (seq {:?}, event {:?})", frame.op, frame.seq, frame.event);
                return Ok(frame);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Dropping undecodable frame: {}", e),
        }
    }
}

fn close_error(frame: Option<&CloseFrame>) -> ClientError {
    match frame {
        Some(f) if u16::from(f.code) == CLOSE_AUTHENTICATION_FAILED => {
            ClientError::Auth(format!("gateway closed with {}: {}", CLOSE_AUTHENTICATION_FAILED, f.reason.as_str()))
        }
        Some(f) => {
            log::info!("Gateway closed with {}: {}", u16::from(f.code), f.reason.as_str());
            ClientError::ConnectionClosed
        }
        None => ClientError::ConnectionClosed,
    }
}
