//! Routes Dispatch frames to the handlers registered for their event.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::codec::Frame;
use super::session::{SequenceCheck, SessionState};
use crate::client::Context;
use crate::config::DispatchMode;
use crate::error::ClientError;
use crate::event::EventHandler;

/// Event name to handlers, in registration order.
///
/// Names are stored lowercased. Registering the same handler twice means it
/// runs twice.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, event: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .entry(event.to_ascii_lowercase())
            .or_default()
            .push(handler);
    }

    /// Snapshot of the handlers for `event`; registrations made afterwards
    /// apply to later events.
    pub fn handlers_for(&self, event: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .get(&event.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .get(&event.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handed off to `handlers` handlers.
    Scheduled { handlers: usize },
    NoHandlers,
    /// Sequence at or below the last one seen; dropped.
    Stale { seq: u64, last: u64 },
    /// The event queue was full; dropped.
    Overflow,
}

struct Job {
    event: String,
    handlers: Vec<Arc<dyn EventHandler>>,
    ctx: Context,
    payload: Value,
}

pub(crate) struct EventDispatcher {
    registry: Arc<HandlerRegistry>,
    session: Arc<SessionState>,
    queue: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl EventDispatcher {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        session: Arc<SessionState>,
        mode: DispatchMode,
        capacity: usize,
    ) -> Self {
        let (queue, worker) = match mode {
            DispatchMode::Queued => {
                let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
                let worker = tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        invoke_handlers(&job.event, &job.handlers, job.ctx, job.payload).await;
                    }
                });
                (Some(tx), Some(worker))
            }
            DispatchMode::Concurrent => (None, None),
        };

        Self {
            registry,
            session,
            queue,
            worker,
        }
    }

    /// Records the frame's sequence and schedules its handlers. Never waits
    /// for a handler to finish.
    pub(crate) fn dispatch(&self, frame: Frame, ctx: &Context) -> DispatchOutcome {
        match self.admit(&frame) {
            Some(stale) => stale,
            None => self.schedule(frame, ctx),
        }
    }

    /// Records the frame's sequence. Returns `Stale` when the frame must be
    /// dropped without any further processing.
    pub(crate) fn admit(&self, frame: &Frame) -> Option<DispatchOutcome> {
        let seq = frame.seq?;
        match self.session.observe_sequence(seq) {
            SequenceCheck::Accepted => None,
            SequenceCheck::Stale { last } => {
                log::warn!(
                    "Dropping {} with sequence {} (last seen {})",
                    frame.event.as_deref().unwrap_or("event"),
                    seq,
                    last
                );
                Some(DispatchOutcome::Stale { seq, last })
            }
        }
    }

    /// Hands an admitted frame to its handlers.
    pub(crate) fn schedule(&self, frame: Frame, ctx: &Context) -> DispatchOutcome {
        let Some(event) = frame.event else {
            return DispatchOutcome::NoHandlers;
        };
        let handlers = self.registry.handlers_for(&event);
        if handlers.is_empty() {
            log::debug!("No handlers for {}", event);
            return DispatchOutcome::NoHandlers;
        }

        let count = handlers.len();
        let job = Job {
            event,
            handlers,
            ctx: ctx.clone(),
            payload: frame.data,
        };
        match &self.queue {
            Some(queue) => match queue.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    log::error!(
                        "Event queue full ({} pending), dropping {}; a handler is not keeping up",
                        queue.max_capacity(),
                        job.event
                    );
                    return DispatchOutcome::Overflow;
                }
                Err(TrySendError::Closed(job)) => {
                    log::error!("Event worker is gone, running {} inline", job.event);
                    tokio::spawn(async move {
                        invoke_handlers(&job.event, &job.handlers, job.ctx, job.payload).await;
                    });
                }
            },
            None => {
                tokio::spawn(async move {
                    invoke_handlers(&job.event, &job.handlers, job.ctx, job.payload).await;
                });
            }
        }
        DispatchOutcome::Scheduled { handlers: count }
    }

    /// Stops accepting events and waits (bounded) for queued ones to finish.
    pub(crate) async fn shutdown(mut self, timeout: Duration) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if tokio::time::timeout(timeout, worker).await.is_err() {
                log::warn!("Event handlers still running after {:?}, leaving them behind", timeout);
            }
        }
    }
}

/// Runs `handlers` one after another. A failing or panicking handler is
/// logged and does not stop the rest. Returns the failures.
pub(crate) async fn invoke_handlers(
    event: &str,
    handlers: &[Arc<dyn EventHandler>],
    ctx: Context,
    payload: Value,
) -> Vec<ClientError> {
    let mut failures = Vec::new();

    for handler in handlers {
        let call = handler.handle(ctx.clone(), payload.clone());
        let message = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string()),
        };

        let error = ClientError::Handler {
            event: event.to_string(),
            message,
        };
        log::error!("{}", error);
        failures.push(error);
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use serde_json::json;

    fn recorder(
        log: Arc<parking_lot::Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> Arc<dyn EventHandler> {
        Arc::new(move |_ctx: Context, payload: Value| {
            let log = log.clone();
            async move {
                log.lock().push(format!("{}:{}", tag, payload["n"]));
                Ok::<(), HandlerError>(())
            }
        })
    }

    #[test]
    fn registry_keeps_order_and_duplicates() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new();
        let handler = recorder(log, "a");

        registry.register("MESSAGE_CREATE", handler.clone());
        registry.register("message_create", handler);

        assert_eq!(registry.count("Message_Create"), 2);
        assert_eq!(registry.count("room_create"), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_later_ones() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let failing: Arc<dyn EventHandler> = Arc::new(|_ctx: Context, _payload: Value| async {
            Err::<(), HandlerError>("nope".into())
        });
        let panicking: Arc<dyn EventHandler> = Arc::new(|_ctx: Context, payload: Value| async move {
            if payload["n"] == 1 {
                panic!("kaboom");
            }
            Ok::<(), HandlerError>(())
        });
        let handlers = vec![failing, panicking, recorder(log.clone(), "ok")];

        let failures = invoke_handlers(
            "message_create",
            &handlers,
            Context::detached(),
            json!({ "n": 1 }),
        )
        .await;

        assert_eq!(failures.len(), 2);
        assert!(failures[1].to_string().contains("kaboom"));
        assert_eq!(*log.lock(), vec!["ok:1".to_string()]);
    }

    #[tokio::test]
    async fn stale_sequence_is_never_dispatched() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("message_create", recorder(log.clone(), "h"));
        let ctx = Context::detached();
        let session = ctx.session.clone();
        let dispatcher = EventDispatcher::new(registry, session, DispatchMode::Queued, 64);

        let first = dispatcher.dispatch(Frame::dispatch(1, "MESSAGE_CREATE", json!({"n": 1})), &ctx);
        let dup = dispatcher.dispatch(Frame::dispatch(1, "MESSAGE_CREATE", json!({"n": 1})), &ctx);
        let old = dispatcher.dispatch(Frame::dispatch(0, "MESSAGE_CREATE", json!({"n": 0})), &ctx);
        let next = dispatcher.dispatch(Frame::dispatch(2, "MESSAGE_CREATE", json!({"n": 2})), &ctx);

        assert_eq!(first, DispatchOutcome::Scheduled { handlers: 1 });
        assert_eq!(dup, DispatchOutcome::Stale { seq: 1, last: 1 });
        assert_eq!(old, DispatchOutcome::Stale { seq: 0, last: 1 });
        assert_eq!(next, DispatchOutcome::Scheduled { handlers: 1 });

        dispatcher.shutdown(Duration::from_secs(1)).await;
        assert_eq!(*log.lock(), vec!["h:1".to_string(), "h:2".to_string()]);
    }

    #[tokio::test]
    async fn queued_mode_preserves_arrival_order() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        let slow_log = log.clone();
        registry.register(
            "typing_start",
            Arc::new(move |_ctx: Context, payload: Value| {
                let log = slow_log.clone();
                async move {
                    if payload["n"] == 1 {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    log.lock().push(payload["n"].to_string());
                    Ok::<(), HandlerError>(())
                }
            }),
        );
        let ctx = Context::detached();
        let dispatcher = EventDispatcher::new(registry, ctx.session.clone(), DispatchMode::Queued, 64);

        for n in 1..=5u64 {
            dispatcher.dispatch(Frame::dispatch(n, "TYPING_START", json!({ "n": n })), &ctx);
        }
        dispatcher.shutdown(Duration::from_secs(5)).await;

        assert_eq!(*log.lock(), vec!["1", "2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn unregistered_event_still_advances_sequence() {
        let ctx = Context::detached();
        let dispatcher = EventDispatcher::new(
            Arc::new(HandlerRegistry::new()),
            ctx.session.clone(),
            DispatchMode::Concurrent,
            64,
        );

        let outcome = dispatcher.dispatch(Frame::dispatch(4, "ROOM_CREATE", json!({})), &ctx);

        assert_eq!(outcome, DispatchOutcome::NoHandlers);
        assert_eq!(ctx.session.sequence(), Some(4));
    }

    #[tokio::test]
    async fn full_queue_drops_with_overflow() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register("message_create", recorder(log.clone(), "h"));
        let ctx = Context::detached();
        let dispatcher = EventDispatcher::new(registry, ctx.session.clone(), DispatchMode::Queued, 2);

        // The worker cannot run before this test yields, so the queue fills up.
        let outcomes: Vec<_> = (1..=4u64)
            .map(|n| dispatcher.dispatch(Frame::dispatch(n, "MESSAGE_CREATE", json!({ "n": n })), &ctx))
            .collect();

        assert_eq!(
            outcomes,
            vec![
                DispatchOutcome::Scheduled { handlers: 1 },
                DispatchOutcome::Scheduled { handlers: 1 },
                DispatchOutcome::Overflow,
                DispatchOutcome::Overflow,
            ]
        );
        assert_eq!(ctx.session.sequence(), Some(4));

        dispatcher.shutdown(Duration::from_secs(1)).await;
        assert_eq!(*log.lock(), vec!["h:1".to_string(), "h:2".to_string()]);
    }

    #[test]
    fn admit_rejects_replays_before_anything_else() {
        let ctx = Context::detached();
        let dispatcher = EventDispatcher::new(
            Arc::new(HandlerRegistry::new()),
            ctx.session.clone(),
            DispatchMode::Concurrent,
            64,
        );

        assert_eq!(dispatcher.admit(&Frame::dispatch(3, "READY", json!({}))), None);
        assert_eq!(
            dispatcher.admit(&Frame::dispatch(2, "READY", json!({}))),
            Some(DispatchOutcome::Stale { seq: 2, last: 3 })
        );
        assert_eq!(dispatcher.admit(&Frame::new(crate::gateway::Opcode::Dispatch, json!({}))), None);
    }
}
