//! An in-process datagram network with deterministic fault injection.
//!
//! Real networks drop, corrupt and duplicate packets. To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`SimNetwork`] moves encoded datagrams between in-memory queues and
//! applies a [`Faults`] profile on the way:
//!
//! | Fault       | Effect                                                    |
//! |-------------|-----------------------------------------------------------|
//! | drop        | The first `drop_first` copies of every distinct packet    |
//! |             | are lost.                                                 |
//! | corrupt     | The next `corrupt_first` copies arrive with a flipped bit |
//! |             | and a stale checksum.                                     |
//! | duplicate   | Every delivered packet arrives twice.                     |
//!
//! Two copies are "the same packet" if flag, addresses, sequence and
//! acknowledgment numbers match, which is exactly what a retransmission is.
//! ACKs are identified by what they acknowledge, their sequence number is
//! ignored. A [`Scope`] restricts the faults to some kinds of packets.

use crate::{
    packet::{Datagram, Flag},
    transport::{is_wanted, Transport},
};
use bytes::Bytes;
use log::trace;
use std::{
    collections::{HashMap, VecDeque},
    io::{self, Error, ErrorKind},
    net::SocketAddr,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// Offset of the acknowledgment number in an encoded datagram.
const ACK_NO_OFFSET: usize = 5;

/// The fault model of a [`SimNetwork`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Faults {
    /// How many copies of every distinct packet are dropped.
    pub drop_first: usize,

    /// How many copies after the dropped ones are corrupted.
    pub corrupt_first: usize,

    /// Whether every delivered packet is delivered twice.
    pub duplicate: bool,

    /// The packets the faults apply to.
    pub scope: Scope,
}

/// The kinds of packets a [`Faults`] profile applies to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Scope {
    All,
    Data,
    Acks,
}

/// An in-memory, lossy datagram network.
#[derive(Debug)]
pub struct SimNetwork {
    arrived: Condvar,
    inner: Mutex<Inner>,
}

/// An endpoint bound on a [`SimNetwork`].
///
/// The endpoint is unbound when this is dropped.
#[derive(Debug)]
pub struct SimTransport {
    addr: SocketAddr,
    network: Arc<SimNetwork>,
    timeout: Duration,
}

/// Counters of what happened on a [`SimNetwork`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Stats {
    pub corrupted: usize,
    pub delivered: usize,
    pub dropped: usize,
    pub unroutable: usize,
}

#[derive(Debug, Default)]
struct Inner {
    copies: HashMap<CopyKey, usize>,
    endpoints: HashMap<SocketAddr, VecDeque<Vec<u8>>>,
    faults: Faults,
    shut_down: bool,
    stats: Stats,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct CopyKey {
    ack_no: u32,
    dest: SocketAddr,
    flag: Flag,
    seq_no: u32,
    src: SocketAddr,
}

impl Faults {
    /// A fault-free profile.
    pub fn none() -> Self {
        Self::default()
    }

    /// Drops the first `n` copies of every packet.
    pub fn drop_first(mut self, n: usize) -> Self {
        self.drop_first = n;
        self
    }

    /// Corrupts the `n` copies following the dropped ones.
    pub fn corrupt_first(mut self, n: usize) -> Self {
        self.corrupt_first = n;
        self
    }

    /// Delivers every packet twice.
    pub fn duplicate(mut self) -> Self {
        self.duplicate = true;
        self
    }

    /// Only applies faults to data packets.
    pub fn data_only(mut self) -> Self {
        self.scope = Scope::Data;
        self
    }

    /// Only applies faults to ACKs.
    pub fn acks_only(mut self) -> Self {
        self.scope = Scope::Acks;
        self
    }

    fn applies_to(&self, datagram: &Datagram) -> bool {
        match self.scope {
            Scope::All => true,
            Scope::Data => !datagram.is_control(),
            Scope::Acks => datagram.flag == Flag::Ack,
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::All
    }
}

impl SimNetwork {
    /// Creates a network with the given fault model.
    pub fn new(faults: Faults) -> Arc<Self> {
        let inner = Inner {
            faults,
            ..Inner::default()
        };

        Arc::new(Self {
            arrived: Condvar::new(),
            inner: Mutex::new(inner),
        })
    }

    /// Creates a fault-free network.
    pub fn reliable() -> Arc<Self> {
        Self::new(Faults::none())
    }

    /// Binds an endpoint whose receives wait at most `timeout`.
    pub fn bind(
        self: &Arc<Self>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> io::Result<SimTransport> {
        if addr.port() == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "the simulated network needs explicit ports",
            ));
        }

        let mut inner = self.lock();
        if inner.endpoints.contains_key(&addr) {
            return Err(ErrorKind::AddrInUse.into());
        }
        inner.endpoints.insert(addr, VecDeque::new());

        Ok(SimTransport {
            addr,
            network: self.clone(),
            timeout,
        })
    }

    /// Delivers a datagram to its destination, bypassing the fault model.
    pub fn inject(&self, datagram: &Datagram) {
        let mut inner = self.lock();
        inner.deliver(datagram.dest, datagram.to_vec(), false);
        self.arrived.notify_all();
    }

    /// Replaces the fault model. Copies are counted afresh from here on.
    pub fn set_faults(&self, faults: Faults) {
        let mut inner = self.lock();
        inner.faults = faults;
        inner.copies.clear();
    }

    /// Ends the network. Every pending and future receive fails with
    /// `UnexpectedEof`.
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.arrived.notify_all();
    }

    /// Gets a snapshot of the counters.
    pub fn stats(&self) -> Stats {
        self.lock().stats
    }

    fn send(&self, datagram: &Datagram) {
        let mut inner = self.lock();
        let faults = inner.faults;
        let applies = faults.applies_to(datagram);

        let copy = if applies {
            let key = CopyKey {
                ack_no: datagram.ack_no,
                dest: datagram.dest,
                flag: datagram.flag,
                seq_no: if datagram.flag == Flag::Ack { 0 } else { datagram.seq_no },
                src: datagram.src,
            };
            let count = inner.copies.entry(key).or_insert(0);
            *count += 1;
            *count
        } else {
            usize::max_value()
        };

        if copy <= faults.drop_first {
            trace!("dropping copy {} of {}", copy, datagram);
            inner.stats.dropped += 1;
            return;
        }

        let mut buf = datagram.to_vec();
        if copy <= faults.drop_first + faults.corrupt_first {
            trace!("corrupting copy {} of {}", copy, datagram);
            buf[ACK_NO_OFFSET] ^= 0x01;
            inner.stats.corrupted += 1;
        }

        let twice = applies && faults.duplicate;
        inner.deliver(datagram.dest, buf, twice);
        self.arrived.notify_all();
    }

    fn recv<F>(&self, addr: SocketAddr, wanted: F, timeout: Duration) -> io::Result<Datagram>
    where
        F: Fn(&Datagram) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if inner.shut_down {
                return Err(ErrorKind::UnexpectedEof.into());
            }

            let queue = match inner.endpoints.get_mut(&addr) {
                Some(queue) => queue,
                None => return Err(ErrorKind::NotConnected.into()),
            };
            while let Some(buf) = queue.pop_front() {
                match Datagram::read_from(&mut Bytes::from(buf)) {
                    Ok(datagram) => {
                        if wanted(&datagram) {
                            return Ok(datagram);
                        }

                        trace!("{} drops unwanted {}", addr, datagram);
                    }
                    Err(e) => trace!("{} drops malformed datagram: {}", addr, e),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::TimedOut.into());
            }

            inner = match self.arrived.wait_timeout(inner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn unbind(&self, addr: SocketAddr) {
        self.lock().endpoints.remove(&addr);
    }

    fn lock(&self) -> MutexGuard<Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn deliver(&mut self, dest: SocketAddr, buf: Vec<u8>, twice: bool) {
        let queue = match self.endpoints.get_mut(&dest) {
            Some(queue) => queue,
            None => {
                trace!("nobody is bound to {}, datagram lost", dest);
                self.stats.unroutable += 1;
                return;
            }
        };

        if twice {
            queue.push_back(buf.clone());
            self.stats.delivered += 1;
        }
        queue.push_back(buf);
        self.stats.delivered += 1;
    }
}

impl SimTransport {
    /// Gets the network this endpoint is bound on.
    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }
}

impl Transport for SimTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn bind_port(&self, port: u16) -> io::Result<Self> {
        self.network
            .bind(SocketAddr::new(self.addr.ip(), port), self.timeout)
    }

    fn send(&mut self, datagram: &Datagram) -> io::Result<()> {
        self.network.send(datagram);
        Ok(())
    }

    fn recv_any(&mut self) -> io::Result<Datagram> {
        self.network.recv(self.addr, |_| true, self.timeout)
    }

    fn recv(&mut self, control_only: bool) -> io::Result<Datagram> {
        self.network
            .recv(self.addr, |d| is_wanted(d, control_only), self.timeout)
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.network.unbind(self.addr);
    }
}
