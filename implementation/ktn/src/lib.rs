//! A minimal, TCP-like transport on top of an unreliable datagram network.
//!
//! A [`Connection`] provides ordered, acknowledged, at-most-once delivery of
//! single-string messages between two endpoints. It implements a three-way
//! handshake, stop-and-wait transfer with bounded retransmission and the
//! active and passive teardown paths. The datagram network itself is
//! abstracted behind the [`Transport`] trait; [`UdpTransport`] talks to real
//! UDP sockets and [`sim::SimNetwork`] is an in-process, fault-injecting
//! network for tests.

// Macros need to lexically come before the rest to be usable
#[macro_use] mod macros;

mod config;
mod connection;
mod error;
mod packet;
mod ports;
pub mod sim;
mod state;
mod transport;
mod udp;

pub use crate::config::Config;
pub use crate::connection::Connection;
pub use crate::error::{Error, Result};
pub use crate::packet::{Datagram, DatagramBuilder, Flag};
pub use crate::ports::{PortLease, PortRegistry, EPHEMERAL_PORTS};
pub use crate::state::State;
pub use crate::transport::{is_timeout, Transport};
pub use crate::udp::UdpTransport;

/// The largest datagram we are willing to receive.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
