//! Embedded control server for a bot-automation host.
//!
//! A [`ControlServer`] listens for plain-TCP clients, acknowledges every
//! payload, disconnects idle peers after a grace notice, and fans inbound
//! text out to subscribers. On startup it registers a UPnP port-forwarding
//! rule with the local gateway so clients outside the network can reach it;
//! the rule is removed when the server stops.

mod conn;
pub mod error;
pub mod events;
pub mod gateway;
pub mod protocol;
pub mod server;

pub use error::{GatewayError, ServerError};
pub use events::{EventBus, Reachability, ReadyInfo, ServerEvent, SubscriberId, Subscription};
pub use gateway::{GatewayMapper, UpnpMapper};
pub use protocol::{Command, parse_command};
pub use server::{ControlServer, ServerConfig};
