use crate::{
    config::Config,
    connection::Connection,
    packet::Datagram,
    ports::PortRegistry,
    transport::{is_wanted, Transport},
    MAX_DATAGRAM_SIZE,
};
use bytes::Bytes;
use log::trace;
use std::{
    io::{self, Error, ErrorKind},
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::{Duration, Instant},
};

/// A transport over a real UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    local_addr: SocketAddr,
    recv_buf: Vec<u8>,
    socket: UdpSocket,
    timeout: Duration,
}

impl UdpTransport {
    /// Binds a UDP socket to the given address.
    ///
    /// The IP must be a concrete one, because it ends up as the source
    /// address of every datagram and the peer matches on it. Port 0 lets the
    /// OS pick a port.
    pub fn bind(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        if addr.ip().is_unspecified() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "cannot bind to an unspecified address",
            ));
        }
        if timeout == Duration::from_secs(0) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "receive timeout must not be zero",
            ));
        }

        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            local_addr,
            recv_buf: vec![0; MAX_DATAGRAM_SIZE],
            socket,
            timeout,
        })
    }

    /// Gets the receive deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Receives until a decodable datagram passing `wanted` arrives or the
    /// deadline passes.
    fn recv_where<F>(&mut self, wanted: F) -> io::Result<Datagram>
    where
        F: Fn(&Datagram) -> bool,
    {
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                return Err(ErrorKind::TimedOut.into());
            }

            self.socket.set_read_timeout(Some(remaining))?;
            let (nread, addr) = self.socket.recv_from(&mut self.recv_buf)?;

            let mut buf = Bytes::from(&self.recv_buf[..nread]);
            match Datagram::read_from(&mut buf) {
                Ok(datagram) => {
                    if wanted(&datagram) {
                        return Ok(datagram);
                    }

                    trace!("dropping unwanted {}", datagram);
                }
                Err(e) => trace!("discarding malformed datagram from {}: {}", addr, e),
            }
        }
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn bind_port(&self, port: u16) -> io::Result<Self> {
        Self::bind(SocketAddr::new(self.local_addr.ip(), port), self.timeout)
    }

    fn send(&mut self, datagram: &Datagram) -> io::Result<()> {
        self.socket.send_to(&datagram.to_vec(), datagram.dest)?;
        Ok(())
    }

    fn recv_any(&mut self) -> io::Result<Datagram> {
        self.recv_where(|_| true)
    }

    fn recv(&mut self, control_only: bool) -> io::Result<Datagram> {
        self.recv_where(|datagram| is_wanted(datagram, control_only))
    }
}

impl Connection<UdpTransport> {
    /// Binds a connection to the given local address with the default
    /// configuration.
    pub fn bind(addr: SocketAddr, registry: Arc<PortRegistry>) -> io::Result<Self> {
        Self::bind_with_config(addr, registry, Config::default())
    }

    /// Binds a connection to the given local address.
    pub fn bind_with_config(
        addr: SocketAddr,
        registry: Arc<PortRegistry>,
        config: Config,
    ) -> io::Result<Self> {
        let transport = UdpTransport::bind(addr, config.recv_timeout)?;
        Ok(Connection::new(transport, registry, config))
    }
}
