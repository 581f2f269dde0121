pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod gateway;
pub mod http;
pub mod model;

pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::client::{Client, ClientBuilder, Context, Credentials};
    pub use crate::config::{DispatchMode, GatewayConfig};
    pub use crate::error::{ClientError, HandlerError};
    pub use crate::event::{names, EventHandler};
    pub use crate::gateway::ConnectionStatus;
    pub use crate::model::*;
}
