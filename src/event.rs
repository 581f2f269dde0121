use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::Context;
use crate::error::HandlerError;

/// Gateway event names the client itself reacts to or that most bots want.
/// Registration is case-insensitive, so `"message_create"` works as well.
pub mod names {
    pub const READY: &str = "READY";
    /// Hiven's name for the initial ready payload.
    pub const INIT_STATE: &str = "INIT_STATE";
    pub const RESUMED: &str = "RESUMED";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
    pub const MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
    pub const MESSAGE_DELETE: &str = "MESSAGE_DELETE";
    pub const HOUSE_JOIN: &str = "HOUSE_JOIN";
    pub const HOUSE_LEAVE: &str = "HOUSE_LEAVE";
    pub const HOUSE_UPDATE: &str = "HOUSE_UPDATE";
    /// A house became unavailable.
    pub const HOUSE_DOWN: &str = "HOUSE_DOWN";
    pub const HOUSE_MEMBER_JOIN: &str = "HOUSE_MEMBER_JOIN";
    pub const HOUSE_MEMBER_LEAVE: &str = "HOUSE_MEMBER_LEAVE";
    pub const ROOM_CREATE: &str = "ROOM_CREATE";
    pub const ROOM_UPDATE: &str = "ROOM_UPDATE";
    pub const ROOM_DELETE: &str = "ROOM_DELETE";
    pub const TYPING_START: &str = "TYPING_START";

    pub(crate) fn is_ready(event: &str) -> bool {
        event.eq_ignore_ascii_case(READY) || event.eq_ignore_ascii_case(INIT_STATE)
    }

    pub(crate) fn is_resumed(event: &str) -> bool {
        event.eq_ignore_ascii_case(RESUMED)
    }
}

/// Something that reacts to a gateway event.
///
/// Closures `Fn(Context, Value) -> impl Future<Output = Result<(), HandlerError>>`
/// implement this automatically, so most code just passes one to
/// [`Client::on`](crate::client::Client::on). Implement it by hand when the
/// handler carries state.
///
/// Returning an error (or panicking) is reported and isolated: other
/// handlers of the same event still run and the session carries on.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: Context, payload: Value) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Context, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: Context, payload: Value) -> Result<(), HandlerError> {
        (self)(ctx, payload).await
    }
}
