//! The socket seam: how the gateway opens connections and writes frames.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use super::codec::{self, Frame};
use crate::error::ClientError;

pub type FrameSink = Pin<Box<dyn Sink<WsMessage, Error = ClientError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WsMessage, ClientError>> + Send>>;

/// Opens a bidirectional message connection to the gateway.
///
/// The default is [`WsConnector`]; tests plug in an in-memory one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), ClientError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<(FrameSink, FrameStream), ClientError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();
        let sink: FrameSink = Box::pin(write.sink_map_err(ClientError::from));
        let stream: FrameStream = Box::pin(read.map(|msg| msg.map_err(ClientError::from)));
        Ok((sink, stream))
    }
}

/// The write half of the current connection.
///
/// Every frame goes through one lock, so the read loop, the heartbeat task
/// and callers never interleave writes. Writes are tagged with the epoch
/// they were issued for; a write for an epoch that is no longer attached
/// fails with `NotConnected`.
pub(crate) struct GatewayWriter {
    sink: Mutex<Option<(u64, FrameSink)>>,
    write_timeout: Duration,
}

impl GatewayWriter {
    pub(crate) fn new(write_timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(None),
            write_timeout,
        }
    }

    pub(crate) async fn attach(&self, epoch: u64, sink: FrameSink) {
        let previous = self.sink.lock().await.replace((epoch, sink));
        if let Some((old_epoch, mut old)) = previous {
            log::debug!("Dropping writer of epoch {}", old_epoch);
            let _ = old.close().await;
        }
    }

    pub(crate) async fn send(&self, epoch: u64, frame: &Frame) -> Result<(), ClientError> {
        let text = codec::encode(frame)?;
        let mut guard = self.sink.lock().await;
        let sink = match guard.as_mut() {
            Some((current, sink)) if *current == epoch => sink,
            _ => return Err(ClientError::NotConnected),
        };

        log::debug!("Sending {:?} frame", frame.op);
        match tokio::time::timeout(self.write_timeout, sink.send(WsMessage::Text(text.into()))).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout("gateway write")),
        }
    }

    /// Sends a close message if still attached, then releases the sink.
    pub(crate) async fn close(&self, timeout: Duration) {
        let taken = self.sink.lock().await.take();
        if let Some((epoch, mut sink)) = taken {
            let graceful = async {
                let _ = sink.send(WsMessage::Close(None)).await;
                let _ = sink.close().await;
            };
            if tokio::time::timeout(timeout, graceful).await.is_err() {
                log::warn!("Close handshake for epoch {} timed out", epoch);
            }
        }
    }

    /// Releases the sink without a close handshake (dead connection).
    pub(crate) async fn detach(&self) {
        self.sink.lock().await.take();
    }
}
