//! The connection automaton: handshake, stop-and-wait transfer and teardown.

use crate::{
    config::Config,
    error::{Error, Result},
    packet::{Datagram, DatagramBuilder, Flag},
    ports::{PortLease, PortRegistry},
    state::State,
    transport::{is_timeout, Transport},
};
use log::{debug, error, trace, warn};
use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    net::SocketAddr,
    num::Wrapping,
    sync::Arc,
    time::Instant,
};

/// How many ephemeral ports `accept` tries to bind before giving up.
const MAX_BIND_ATTEMPTS: usize = 8;

/// How many answered SYNs a listener remembers to recognize repetitions.
const MAX_REMEMBERED_SYNS: usize = 64;

/// How many unexpected replies one transmission may draw before the
/// exchange is abandoned.
const MAX_STRAYS_PER_TRANSMISSION: usize = 8;

/// A reliable, connection-oriented channel to one peer.
///
/// A connection is either opened actively with [`connect`](Connection::connect),
/// or used as a listener whose [`accept`](Connection::accept) hands out a new,
/// independent connection per peer. The listener itself never carries user
/// traffic.
///
/// Messages are delivered in order and at most once, with one message in
/// flight at a time. None of the methods may be called concurrently on the
/// same connection.
#[derive(Debug)]
pub struct Connection<T> {
    /// The SYNs a listener has already spawned a connection for.
    answered_syns: VecDeque<(SocketAddr, u32)>,

    config: Config,

    /// The last packet from the peer that passed all checks.
    ///
    /// Its ACK is repeated whenever something unexpected arrives, which makes
    /// the peer retransmit what we actually need.
    last_accepted: Option<Datagram>,

    /// The port reservation of connections spawned by `accept`.
    lease: Option<PortLease>,

    local_addr: SocketAddr,
    next_seq_no: Wrapping<u32>,

    /// A message that arrived, and was acknowledged, while we were waiting
    /// for something else. `receive` hands it out first.
    pending: Option<Datagram>,

    registry: Arc<PortRegistry>,
    remote_addr: Option<SocketAddr>,
    state: State,
    transport: T,
}

impl<T: Transport> Connection<T> {
    /// Creates a closed connection on top of the given transport.
    ///
    /// `registry` provides the ports of connections spawned by `accept`.
    pub fn new(transport: T, registry: Arc<PortRegistry>, config: Config) -> Self {
        Self {
            answered_syns: VecDeque::new(),
            config,
            last_accepted: None,
            lease: None,
            local_addr: transport.local_addr(),
            next_seq_no: Wrapping(rand::random()),
            pending: None,
            registry,
            remote_addr: None,
            state: State::Closed,
            transport,
        }
    }

    /// Creates the per-peer connection of a listener.
    fn spawned(
        transport: T,
        lease: PortLease,
        remote_addr: SocketAddr,
        registry: Arc<PortRegistry>,
        config: Config,
    ) -> Self {
        let mut conn = Self::new(transport, registry, config);
        conn.lease = Some(lease);
        conn.remote_addr = Some(remote_addr);
        conn.state = State::SynRcvd;
        conn
    }

    /// Gets the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Gets a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// Gets a mutable reference to the underlying transport.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Gets the local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gets the sequence number the next data unit will carry.
    pub fn next_seq_no(&self) -> u32 {
        self.next_seq_no.0
    }

    /// Gets the peer's address, once a handshake has established it.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Gets the current state.
    pub fn state(&self) -> State {
        self.state
    }
}

// Handshake
impl<T: Transport> Connection<T> {
    /// Establishes a connection to the given remote.
    ///
    /// The SYN is retransmitted until a SYN_ACK arrives or the resend budget
    /// is exhausted. The peer answers from the port of its per-connection
    /// endpoint, which then becomes our remote address. Should our ACK get
    /// lost, the peer's repeated SYN_ACK is acknowledged again later on.
    ///
    /// On `HandshakeTimeout` the connection is back in `CLOSED` and
    /// `connect` may be retried.
    pub fn connect(&mut self, remote_addr: SocketAddr) -> Result<()> {
        if self.state != State::Closed {
            return Err(Error::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }

        self.remote_addr = Some(remote_addr);
        let syn = self.next_control_packet(Flag::Syn, 0, remote_addr);
        self.set_state(State::SynSent);

        let syn_seq_no = syn.seq_no;
        let reply = self.exchange(&syn, |reply| {
            reply.flag == Flag::SynAck
                && reply.ack_no == syn_seq_no
                && reply.src.ip() == remote_addr.ip()
        })?;
        let syn_ack = match reply {
            Some(syn_ack) => syn_ack,
            None => {
                warn!("{} did not answer our SYN", remote_addr);
                self.remote_addr = None;
                self.set_state(State::Closed);
                return Err(Error::HandshakeTimeout);
            }
        };

        self.remote_addr = Some(syn_ack.src);
        self.send_ack(&syn_ack)?;
        self.last_accepted = Some(syn_ack);
        self.set_state(State::Established);

        Ok(())
    }

    /// Waits for a peer to connect and returns the connection to it.
    ///
    /// Blocks until a new SYN arrives; anything else, including repetitions
    /// of SYNs that were answered already, is discarded. The returned
    /// connection is bound to a fresh ephemeral port and owns its own state
    /// and sequence numbers. This connection stays in `LISTEN`, also when
    /// the handshake with the peer fails.
    pub fn accept(&mut self) -> Result<Connection<T>> {
        match self.state {
            State::Closed => self.set_state(State::Listen),
            State::Listen => {}
            state => {
                return Err(Error::InvalidState {
                    operation: "accept",
                    state,
                })
            }
        }

        let syn = self.await_syn()?;
        debug!("{} received SYN from {}", self.local_addr, syn.src);

        let (lease, transport) = self.bind_ephemeral()?;
        let mut conn = Connection::spawned(
            transport,
            lease,
            syn.src,
            self.registry.clone(),
            self.config,
        );

        match conn.answer_syn(syn) {
            Ok(()) => {
                debug!("accepted {:?} on {}", conn.remote_addr, conn.local_addr);
                Ok(conn)
            }
            Err(e) => {
                warn!("handshake with spawned connection failed: {}", e);
                Err(e)
            }
        }
    }

    /// Blocks until a valid SYN arrives that was not seen before.
    fn await_syn(&mut self) -> Result<Datagram> {
        loop {
            let packet = match self.transport.recv(true) {
                Ok(packet) => packet,
                Err(ref e) if is_timeout(e) => continue,
                Err(e) => return Err(e.into()),
            };

            if packet.flag != Flag::Syn || !packet.has_valid_checksum() {
                trace!("listener discards {}", packet);
                continue;
            }

            let key = (packet.src, packet.seq_no);
            if self.answered_syns.contains(&key) {
                debug!("{} repeated SYN {}, ignoring", packet.src, packet.seq_no);
                continue;
            }

            if self.answered_syns.len() >= MAX_REMEMBERED_SYNS {
                self.answered_syns.pop_front();
            }
            self.answered_syns.push_back(key);

            return Ok(packet);
        }
    }

    /// Reserves an ephemeral port and binds a transport to it.
    fn bind_ephemeral(&self) -> Result<(PortLease, T)> {
        for _ in 0..MAX_BIND_ATTEMPTS {
            let lease = self.registry.allocate()?;

            match self.transport.bind_port(lease.port()) {
                Ok(transport) => return Ok((lease, transport)),
                Err(e) => debug!("cannot bind port {}: {}", lease.port(), e),
            }
        }

        Err(io::Error::new(ErrorKind::AddrInUse, "no bindable ephemeral port").into())
    }

    /// Answers the SYN on a spawned connection and waits for the final ACK.
    ///
    /// The peer's first message also completes the handshake, its ACK may
    /// have been lost on the way.
    fn answer_syn(&mut self, syn: Datagram) -> Result<()> {
        let syn_ack = self.next_control_packet(Flag::SynAck, syn.seq_no, syn.src);
        let first_seq_no = syn.seq_no.wrapping_add(1);
        self.last_accepted = Some(syn);

        let (remote_addr, syn_ack_seq_no) = (syn_ack.dest, syn_ack.seq_no);
        let reply = self.exchange(&syn_ack, |reply| {
            let is_final_ack = reply.flag == Flag::Ack && reply.ack_no == syn_ack_seq_no;
            let is_first_data = reply.flag == Flag::None && reply.seq_no == first_seq_no;

            reply.src == remote_addr && (is_final_ack || is_first_data)
        })?;

        match reply {
            Some(reply) => {
                self.set_state(State::Established);
                if reply.flag == Flag::None {
                    debug!("{} sent data before its ACK arrived", remote_addr);
                    self.handle_stray(reply)?;
                }

                Ok(())
            }
            None => Err(Error::HandshakeTimeout),
        }
    }
}

// Data transfer
impl<T: Transport> Connection<T> {
    /// Sends a message and waits until the peer has acknowledged it.
    ///
    /// Corrupted, stale and out-of-order acknowledgments trigger a
    /// retransmission. Repeated packets of the peer are acknowledged again,
    /// and its next message is acknowledged and kept for `receive`. If no
    /// acknowledgment at all arrives within the resend budget, or the peer
    /// floods us with unexpected replies, the connection is lost and moves
    /// to `CLOSED`.
    pub fn send(&mut self, message: &str) -> Result<()> {
        if !self.state.is_established() {
            return Err(Error::NotConnected);
        }

        let remote_addr = self.remote()?;
        let seq_no = self.next_seq_no.0;
        let packet = DatagramBuilder::new()
            .flag(Flag::None)
            .seq_no(seq_no)
            .src(self.local_addr)
            .dest(remote_addr)
            .payload(message)
            .build();

        let ack = self.exchange(&packet, |reply| {
            reply.flag == Flag::Ack && reply.src == remote_addr && reply.ack_no == seq_no
        })?;

        match ack {
            Some(_) => {
                trace!("seq {} acknowledged", seq_no);
                self.next_seq_no += Wrapping(1);
                Ok(())
            }
            None => {
                warn!("no ACK for seq {}, connection lost", seq_no);
                self.set_state(State::Closed);
                Err(Error::ConnectionLost)
            }
        }
    }

    /// Blocks until the next message from the peer arrives.
    ///
    /// Returns `EndOfStream` once the peer has closed its side; the
    /// connection is then in `CLOSE_WAIT` and should be `close`d.
    pub fn receive(&mut self) -> Result<String> {
        match self.state {
            State::Established => {}
            State::CloseWait => return Err(Error::EndOfStream),
            _ => return Err(Error::NotConnected),
        }

        if let Some(packet) = self.pending.take() {
            trace!("handing out buffered seq {}", packet.seq_no);
            return Ok(packet.payload);
        }

        let mut receives = 0;
        loop {
            let packet = match self.transport.recv_any() {
                Ok(packet) => packet,
                Err(ref e) if is_timeout(e) => {
                    if receives < self.config.max_receives {
                        receives += 1;
                        trace!("nothing received yet, waiting again ({})", receives);
                        continue;
                    }

                    warn!("nothing received after {} attempts, connection lost", receives);
                    self.set_state(State::Closed);
                    return Err(Error::ConnectionLost);
                }
                Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!("transport reached end of stream");
                    self.set_state(State::CloseWait);
                    return Err(Error::EndOfStream);
                }
                Err(e) => return Err(e.into()),
            };

            if self.is_ghost(&packet) {
                debug!(
                    "discarding ghost packet from {}, peer is {:?}",
                    packet.src, self.remote_addr,
                );
                continue;
            }

            if !packet.has_valid_checksum() {
                debug!("checksum of {} invalid, re-acknowledging last packet", packet);
                self.reack_last()?;
                continue;
            }

            match packet.flag {
                Flag::None => {}
                Flag::Fin => {
                    debug!("{} has closed its side", packet.src);
                    self.send_ack(&packet)?;
                    self.last_accepted = Some(packet);
                    self.set_state(State::CloseWait);
                    return Err(Error::EndOfStream);
                }
                _ => {
                    self.handle_stray(packet)?;
                    continue;
                }
            }

            if !self.is_next_in_sequence(&packet) {
                debug!(
                    "seq {} is out of order, re-acknowledging last packet",
                    packet.seq_no,
                );
                self.reack_last()?;
                continue;
            }

            self.send_ack(&packet)?;
            let payload = packet.payload.clone();
            self.last_accepted = Some(packet);

            return Ok(payload);
        }
    }

    fn is_ghost(&self, packet: &Datagram) -> bool {
        self.remote_addr != Some(packet.src)
    }

    fn is_last_accepted(&self, packet: &Datagram) -> bool {
        match self.last_accepted {
            Some(ref last) => last.flag == packet.flag && last.seq_no == packet.seq_no,
            None => false,
        }
    }

    fn is_next_in_sequence(&self, packet: &Datagram) -> bool {
        match self.last_accepted {
            Some(ref last) => packet.seq_no == last.seq_no.wrapping_add(1),
            None => true,
        }
    }
}

// Teardown
impl<T: Transport> Connection<T> {
    /// Closes the connection.
    ///
    /// From `ESTABLISHED` this performs the active close and returns after
    /// TIME_WAIT. From `CLOSE_WAIT`, i.e. after `receive` reported
    /// `EndOfStream`, it completes the passive close. A listener simply
    /// stops listening, and closing a closed connection does nothing.
    ///
    /// On error the connection stays in the teardown state it had reached.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            State::Established | State::SynRcvd => self.active_close(),
            State::CloseWait => self.passive_close(),
            State::Listen => {
                self.set_state(State::Closed);
                Ok(())
            }
            State::Closed => Ok(()),
            state => Err(Error::InvalidState {
                operation: "close",
                state,
            }),
        }
    }

    fn active_close(&mut self) -> Result<()> {
        let remote_addr = self.remote()?;
        let fin = self.next_control_packet(Flag::Fin, 0, remote_addr);
        self.set_state(State::FinWait1);

        // The peer's FIN implies that ours arrived
        let fin_seq_no = fin.seq_no;
        let reply = self.exchange(&fin, |reply| {
            let is_ack = reply.flag == Flag::Ack && reply.ack_no == fin_seq_no;

            reply.src == remote_addr && (is_ack || reply.flag == Flag::Fin)
        })?;
        let reply = match reply {
            Some(reply) => reply,
            None => {
                warn!("{} never acknowledged our FIN", remote_addr);
                return Err(Error::TeardownFailure("FIN was not acknowledged"));
            }
        };
        self.set_state(State::FinWait2);

        let peer_fin = if reply.flag == Flag::Fin {
            debug!("{} sent its FIN before acknowledging ours", remote_addr);
            reply
        } else {
            match self.await_peer_fin(remote_addr)? {
                Some(fin) => fin,
                None => {
                    warn!("{} never sent its FIN", remote_addr);
                    return Err(Error::TeardownFailure("peer did not send FIN"));
                }
            }
        };

        self.send_ack(&peer_fin)?;
        self.last_accepted = Some(peer_fin);
        self.set_state(State::TimeWait);

        self.absorb_duplicates()?;
        self.set_state(State::Closed);

        Ok(())
    }

    fn passive_close(&mut self) -> Result<()> {
        let remote_addr = self.remote()?;

        // Repeat the ACK of the peer's FIN, the first one may have been lost
        self.reack_last()?;

        let fin = self.next_control_packet(Flag::Fin, 0, remote_addr);
        self.set_state(State::LastAck);

        let fin_seq_no = fin.seq_no;
        let ack = self.exchange(&fin, |reply| {
            reply.flag == Flag::Ack
                && reply.ack_no == fin_seq_no
                && reply.src == remote_addr
        })?;

        match ack {
            Some(_) => {
                self.set_state(State::Closed);
                Ok(())
            }
            None => {
                warn!("{} never acknowledged our FIN", remote_addr);
                Err(Error::TeardownFailure("FIN was not acknowledged"))
            }
        }
    }

    /// Waits in FIN_WAIT_2 for the peer's FIN.
    fn await_peer_fin(&mut self, remote_addr: SocketAddr) -> Result<Option<Datagram>> {
        let max_strays = self.max_strays();
        let (mut silent, mut strays) = (0, 0);

        loop {
            let packet = match self.next_reply()? {
                Some(packet) => packet,
                None => {
                    silent += 1;
                    if silent > self.config.max_receives {
                        return Ok(None);
                    }
                    continue;
                }
            };

            let is_peer_fin = packet.flag == Flag::Fin
                && packet.src == remote_addr
                && packet.has_valid_checksum();
            if is_peer_fin {
                return Ok(Some(packet));
            }

            strays += 1;
            if strays > max_strays {
                warn!("{} keeps sending everything but its FIN", remote_addr);
                return Ok(None);
            }
            self.handle_stray(packet)?;
        }
    }

    /// Spends TIME_WAIT answering retransmissions of the peer.
    fn absorb_duplicates(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.config.time_wait;

        while Instant::now() < deadline {
            match self.transport.recv_any() {
                Ok(packet) => self.handle_stray(packet)?,
                Err(ref e) if is_timeout(e) => {}
                Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }
}

// Plumbing
impl<T: Transport> Connection<T> {
    /// Transmits a packet until a reply passing `accept` arrives.
    ///
    /// A transmission that draws no reply at all counts against the resend
    /// budget. A corrupted reply is answered with an immediate
    /// retransmission instead, and so is the first ACK of each unexpected
    /// acknowledgment number. Everything else goes to `handle_stray` while
    /// we keep waiting.
    fn exchange<F>(&mut self, packet: &Datagram, accept: F) -> Result<Option<Datagram>>
    where
        F: Fn(&Datagram) -> bool,
    {
        let max_strays = self.max_strays();
        let (mut silent, mut strays) = (0, 0);
        let mut resent_for = Vec::new();

        loop {
            trace!("sending {}", packet);
            let mut reply = self.transport.send_with_retransmit(packet)?;

            let answered = loop {
                let reply_packet = match reply.take() {
                    Some(reply_packet) => reply_packet,
                    None => break false,
                };

                if reply_packet.has_valid_checksum() && accept(&reply_packet) {
                    return Ok(Some(reply_packet));
                }

                strays += 1;
                if strays > max_strays {
                    warn!("{} unexpected replies to {}, giving up", strays, packet);
                    return Ok(None);
                }

                if !self.is_ghost(&reply_packet) {
                    if !reply_packet.has_valid_checksum() {
                        debug!("reply to {} is corrupted, resending", packet);
                        break true;
                    }
                    if reply_packet.flag == Flag::Ack && !resent_for.contains(&reply_packet.ack_no) {
                        debug!("invalid acknowledgment {}, resending {}", reply_packet, packet);
                        resent_for.push(reply_packet.ack_no);
                        break true;
                    }
                }

                self.handle_stray(reply_packet)?;
                reply = self.next_reply()?;
            };

            if !answered {
                silent += 1;
                if silent >= self.config.max_resends {
                    return Ok(None);
                }

                debug!("no reply to {} ({}), resending", packet, silent);
            }
        }
    }

    /// Deals with a packet that is not what we are waiting for.
    ///
    /// Repetitions of the last accepted packet are acknowledged again, the
    /// peer evidently missed our ACK. The peer's next message is acknowledged
    /// and kept for `receive`, if there is room. Everything else is dropped.
    fn handle_stray(&mut self, packet: Datagram) -> Result<()> {
        if self.is_ghost(&packet) {
            debug!("discarding ghost packet {}", packet);
            return Ok(());
        }
        if !packet.has_valid_checksum() {
            debug!("checksum of {} invalid, re-acknowledging last packet", packet);
            return self.reack_last();
        }

        match packet.flag {
            Flag::None | Flag::Fin | Flag::SynAck if self.is_last_accepted(&packet) => {
                debug!("{} arrived again, re-acknowledging", packet);
                self.send_ack(&packet)
            }
            Flag::None
                if self.state.is_established()
                    && self.pending.is_none()
                    && self.is_next_in_sequence(&packet) =>
            {
                debug!("keeping seq {} for the next receive", packet.seq_no);
                self.send_ack(&packet)?;
                self.last_accepted = Some(packet.clone());
                self.pending = Some(packet);
                Ok(())
            }
            _ => {
                trace!("discarding {} in {}", packet, self.state);
                Ok(())
            }
        }
    }

    fn max_strays(&self) -> usize {
        self.config.max_resends * MAX_STRAYS_PER_TRANSMISSION
    }

    /// Waits one receive window for any packet.
    fn next_reply(&mut self) -> Result<Option<Datagram>> {
        match self.transport.recv_any() {
            Ok(packet) => Ok(Some(packet)),
            Err(ref e) if is_timeout(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Builds an ACK for the given packet. ACKs don't consume a sequence
    /// number.
    fn ack_for(&self, acked: &Datagram) -> Datagram {
        DatagramBuilder::new()
            .flag(Flag::Ack)
            .seq_no(self.next_seq_no.0)
            .ack_no(acked.seq_no)
            .src(self.local_addr)
            .dest(acked.src)
            .build()
    }

    /// Builds a SYN, SYN_ACK or FIN and consumes a sequence number.
    fn next_control_packet(
        &mut self,
        flag: Flag,
        ack_no: u32,
        dest: SocketAddr,
    ) -> Datagram {
        let packet = DatagramBuilder::new()
            .flag(flag)
            .seq_no(self.next_seq_no.0)
            .ack_no(ack_no)
            .src(self.local_addr)
            .dest(dest)
            .build();

        self.next_seq_no += Wrapping(1);
        packet
    }

    /// Re-sends the ACK of the last accepted packet, if there is one.
    fn reack_last(&mut self) -> Result<()> {
        let ack = match self.last_accepted {
            Some(ref last) => self.ack_for(last),
            None => return Ok(()),
        };

        trace!("re-sending {}", ack);
        self.transport.send(&ack)?;
        Ok(())
    }

    fn remote(&self) -> Result<SocketAddr> {
        self.remote_addr.ok_or(Error::NotConnected)
    }

    fn send_ack(&mut self, acked: &Datagram) -> Result<()> {
        let ack = self.ack_for(acked);

        trace!("sending {}", ack);
        self.transport.send(&ack)?;
        Ok(())
    }

    /// Moves the automaton to `next`, unless that edge does not exist.
    fn set_state(&mut self, next: State) {
        if !self.state.can_transition_to(next) {
            error!("refusing illegal transition {} -> {}", self.state, next);
            return;
        }

        debug!("{}: {} -> {}", self.local_addr, self.state, next);
        self.state = next;
    }
}
