pub mod batch;
pub mod client;
pub mod connection;
pub mod encoding;
pub mod record;
pub mod register;
pub mod service;
pub mod span;
mod worker;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{Client, Connector, TcpConnector};
pub use connection::{ConnectionState, Destination, DeviceStatus, Payload};
pub use encoding::EncodingError;
pub use record::*;
pub use register::*;
pub use service::*;
pub use span::BlockKind;
