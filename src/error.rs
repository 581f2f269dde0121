//! Error types used across the library.

use thiserror::Error;

/// Boxed error a user handler may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Why a gateway frame could not be turned into a [`Frame`](crate::gateway::Frame).
///
/// Decode errors are never fatal: the connection drops the offending frame,
/// logs it and keeps reading.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("dispatch frame without an event name")]
    MissingEventName,
}

/// The error type returned by pretty much everything in the library.
///
/// You can match on the variant to figure out what went wrong. Transport
/// failures ([`WebSocket`](ClientError::WebSocket),
/// [`ConnectionClosed`](ClientError::ConnectionClosed), ...) are handled by the
/// client itself by reconnecting; you mostly see them from REST calls.
/// [`Auth`](ClientError::Auth) ends the session for good.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Not for bad status codes like 403 or 404 -- those show up as
    /// [`Api`](ClientError::Api). This is for transport-level stuff like
    /// DNS failures, TLS errors, timeouts, etc.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Connection closed by server")]
    ConnectionClosed,

    /// A bounded wait (connect, hello, ready, write) ran out.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The token was empty or the gateway rejected it.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Returned right away by REST calls and gateway writes made while the
    /// session is not `Ready`, or whose connection epoch ended mid-flight.
    #[error("Not connected to the gateway")]
    NotConnected,

    #[error("Handler for '{event}' failed: {message}")]
    Handler { event: String, message: String },

    /// The string contains the status and body, like
    /// `"HTTP 403: {\"code\": 403, \"message\": \"Forbidden\"}"`.
    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Gave up after {0} reconnect attempts")]
    ReconnectLimit(u32),
}

impl ClientError {
    /// Errors that must end the session instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Auth(_) | ClientError::Config(_) | ClientError::ReconnectLimit(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_is_fatal_transport_is_not() {
        assert!(ClientError::Auth("bad token".into()).is_fatal());
        assert!(ClientError::ReconnectLimit(3).is_fatal());
        assert!(!ClientError::ConnectionClosed.is_fatal());
        assert!(!ClientError::Timeout("hello").is_fatal());
    }

    #[test]
    fn handler_error_mentions_event() {
        let err = ClientError::Handler {
            event: "message_create".into(),
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "Handler for 'message_create' failed: boom");
    }
}
