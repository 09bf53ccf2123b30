pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod api;
pub mod captive;
pub mod codec;
pub mod commission;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod hw;
pub mod mesh;
pub mod mqtt;
pub mod node;
pub mod ota;
pub mod registry;
pub mod uplink;

pub mod prelude {
    pub use crate::codec::{decode, encode, DecodeError, Frame, MsgType};
    pub use crate::error::ApiError;
    pub use crate::gateway::Gateway;
    pub use crate::node::{DeviceType, NodeMac, NodeRecord, NodeStatus};
}
