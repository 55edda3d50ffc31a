//! Reverse tunnel client.
//!
//! One connection to the tunnel server carries every forwarded byte. The server tells us
//! which local TCP/UDP ports to open; traffic on them is framed with the negotiated codec
//! and multiplexed onto that connection, and frames coming back are routed to the local
//! peer they name.

pub mod client;
pub mod codec;
pub mod frame;
pub mod listener;
pub mod protocol;
pub mod reactor;
pub mod reader;
pub mod session;
