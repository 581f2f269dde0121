//! The gateway session core.
//!
//! The connection manager reads frames, the codec decodes them, the session
//! state records the sequence and the dispatcher hands events to handlers.
//! The heartbeat task writes through the same serialized writer as
//! everything else.

mod backoff;
mod codec;
mod connection;
mod dispatcher;
mod heartbeat;
mod session;
mod transport;

pub use codec::{decode, decode_text, encode, Frame, Opcode};
pub use connection::CLOSE_AUTHENTICATION_FAILED;
pub use dispatcher::{DispatchOutcome, HandlerRegistry};
pub use heartbeat::HeartbeatOutcome;
pub use session::{ConnectionStatus, Epoch, ResumeInfo, SequenceCheck, SessionState};
pub use transport::{Connector, FrameSink, FrameStream, WsConnector};

pub(crate) use connection::Gateway;
pub(crate) use dispatcher::EventDispatcher;
pub(crate) use transport::GatewayWriter;
