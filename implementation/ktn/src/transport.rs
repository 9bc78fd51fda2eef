//! The interface to the unreliable datagram network underneath a connection.

use crate::packet::{Datagram, Flag};
use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
};

/// A bound, connectionless datagram endpoint.
///
/// Receiving blocks for at most the transport's deadline. A deadline passing
/// is reported as an error of kind `TimedOut` or `WouldBlock` (see
/// [`is_timeout`]), the end of the underlying network as `UnexpectedEof`.
pub trait Transport: Sized {
    /// The address this transport is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Binds another transport on the same local IP, but on `port`.
    fn bind_port(&self, port: u16) -> io::Result<Self>;

    /// Sends a datagram to its destination, without any delivery guarantee.
    fn send(&mut self, datagram: &Datagram) -> io::Result<()>;

    /// Blocks until a datagram of any kind arrives or the deadline passes.
    fn recv_any(&mut self) -> io::Result<Datagram>;

    /// Blocks until a matching datagram arrives or the deadline passes.
    ///
    /// If `control_only` is set, only control packets are returned. Otherwise
    /// data packets and FINs are returned. Everything else is consumed and
    /// dropped.
    fn recv(&mut self, control_only: bool) -> io::Result<Datagram>;

    /// Sends the datagram and waits for the first reply.
    ///
    /// Returns `None` if nothing arrived within the deadline. The reply may be
    /// of any kind and is not validated, that is up to the caller, which also
    /// decides whether to retransmit.
    fn send_with_retransmit(
        &mut self,
        datagram: &Datagram,
    ) -> io::Result<Option<Datagram>> {
        self.send(datagram)?;

        match self.recv_any() {
            Ok(reply) => Ok(Some(reply)),
            Err(ref e) if is_timeout(e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Checks whether the error signals an elapsed receive deadline.
pub fn is_timeout(err: &io::Error) -> bool {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => true,
        _ => false,
    }
}

/// Checks whether a datagram passes the `control_only` filter of
/// [`Transport::recv`].
pub(crate) fn is_wanted(datagram: &Datagram, control_only: bool) -> bool {
    if control_only {
        datagram.is_control()
    } else {
        match datagram.flag {
            Flag::None | Flag::Fin => true,
            _ => false,
        }
    }
}
