//! Chat peers of a local network: discovery by broadcast, one-line messages
//! and reliable file transfer over UDP with flow control.

mod util;

pub mod config;
pub mod packet;
pub mod presence;
pub mod transport;
pub mod adapters;
pub mod listener;
pub mod transfer;
pub mod events;
pub mod node;

pub use config::{Config, TransferConfig, DEFAULT_PORT, MAX_PACKET_LEN};
pub use node::{Node, NodeEvent};
pub use util::net::{local_ipv4};
