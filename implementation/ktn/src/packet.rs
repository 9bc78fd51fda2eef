//! The datagram exchanged between two connections and its wire format.
//!
//! All integers are in network byte order:
//!
//! ```text
//! flag: u8 | seq_no: u32 | ack_no: u32 | src: addr | dest: addr
//!          | payload length: u32 | payload: utf-8 | checksum: u32
//!
//! addr = family: u8 (4 or 6) | ip: 4 or 16 bytes | port: u16
//! ```
//!
//! The checksum is a CRC-32 over everything in front of it. Decoding does not
//! verify it; that decision belongs to the connection, which may have to
//! answer a corrupted packet.

use byteorder::{NetworkEndian, WriteBytesExt};
use bytes::{Buf, Bytes, IntoBuf};
use flate2::Crc;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::{self, Cursor, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

const U16_SIZE: usize = 2;
const U32_SIZE: usize = 4;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// The control flag of a datagram.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Flag {
    /// A data packet.
    None,
    Syn,
    SynAck,
    Ack,
    Fin,
}

/// A single datagram.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Datagram {
    pub ack_no: u32,
    pub checksum: u32,
    pub dest: SocketAddr,
    pub flag: Flag,
    pub payload: String,
    pub seq_no: u32,
    pub src: SocketAddr,
}

/// A builder for datagrams.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DatagramBuilder {
    ack_no: u32,
    dest: Option<SocketAddr>,
    flag: Option<Flag>,
    payload: String,
    seq_no: Option<u32>,
    src: Option<SocketAddr>,
}

impl Flag {
    /// Whether the flag marks a control packet.
    pub fn is_control(self) -> bool {
        self != Flag::None
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Flag::None),
            1 => Some(Flag::Syn),
            2 => Some(Flag::SynAck),
            3 => Some(Flag::Ack),
            4 => Some(Flag::Fin),
            _ => None,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Flag::None => 0,
            Flag::Syn => 1,
            Flag::SynAck => 2,
            Flag::Ack => 3,
            Flag::Fin => 4,
        }
    }
}

impl Display for Flag {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let name = match self {
            Flag::None => "DATA",
            Flag::Syn => "SYN",
            Flag::SynAck => "SYN_ACK",
            Flag::Ack => "ACK",
            Flag::Fin => "FIN",
        };

        name.fmt(fmt)
    }
}

impl Datagram {
    /// Computes the checksum over all other fields.
    pub fn calculate_checksum(&self) -> u32 {
        let mut buf = Cursor::new(Vec::with_capacity(self.binary_len()));
        self.write_fields(&mut buf).unwrap();

        let mut crc = Crc::new();
        crc.update(buf.get_ref());
        crc.sum()
    }

    /// Checks whether the stored checksum matches the contents.
    pub fn has_valid_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Whether this is a control packet.
    pub fn is_control(&self) -> bool {
        self.flag.is_control()
    }

    /// Gets the length of the datagram in serialized form.
    pub fn binary_len(&self) -> usize {
        fn addr_len(addr: &SocketAddr) -> usize {
            let ip_len = if addr.is_ipv4() { 4 } else { 16 };
            1 + ip_len + U16_SIZE
        }

        1 + 3 * U32_SIZE
            + addr_len(&self.src)
            + addr_len(&self.dest)
            + self.payload.len()
            + U32_SIZE
    }
}

impl Datagram {
    /// Reads a datagram from the given buffer and advances it past the
    /// consumed bytes.
    ///
    /// The checksum is read, not verified.
    pub fn read_from(r: &mut Bytes) -> io::Result<Datagram> {
        let (datagram, consumed) = {
            let mut buf = r.as_ref().into_buf();

            assert_size!(buf, 1 + 2 * U32_SIZE);
            let flag_byte = buf.get_u8();
            let flag = match Flag::from_u8(flag_byte) {
                Some(flag) => flag,
                None => invalid_data!("unknown flag {:#x}", flag_byte),
            };
            let seq_no = buf.get_u32_be();
            let ack_no = buf.get_u32_be();

            let src = read_addr(&mut buf)?;
            let dest = read_addr(&mut buf)?;

            assert_size!(buf, U32_SIZE);
            let payload_len = buf.get_u32_be() as usize;
            assert_size!(buf, payload_len + U32_SIZE);
            let mut payload = vec![0; payload_len];
            buf.copy_to_slice(&mut payload);
            let payload = match String::from_utf8(payload) {
                Ok(payload) => payload,
                Err(e) => invalid_data!("payload is not utf-8: {}", e),
            };

            let checksum = buf.get_u32_be();

            let datagram = Datagram {
                ack_no,
                checksum,
                dest,
                flag,
                payload,
                seq_no,
                src,
            };
            (datagram, buf.position() as usize)
        };

        r.advance(consumed);
        Ok(datagram)
    }

    /// Writes the datagram, including the stored checksum, to the given
    /// writer.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        self.write_fields(w)?;
        w.write_u32::<NetworkEndian>(self.checksum)
    }

    /// Writes the datagram to a new vector of bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::with_capacity(self.binary_len()));
        self.write_to(&mut buf).unwrap();
        buf.into_inner()
    }

    /// Writes everything the checksum is computed over.
    fn write_fields(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u8(self.flag.to_u8())?;
        w.write_u32::<NetworkEndian>(self.seq_no)?;
        w.write_u32::<NetworkEndian>(self.ack_no)?;
        write_addr(&self.src, w)?;
        write_addr(&self.dest, w)?;
        w.write_u32::<NetworkEndian>(self.payload.len() as u32)?;
        w.write_all(self.payload.as_bytes())
    }
}

impl From<Datagram> for Vec<u8> {
    fn from(datagram: Datagram) -> Self {
        datagram.to_vec()
    }
}

impl Display for Datagram {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(
            fmt,
            "{} {} -> {} seq={} ack={}",
            self.flag, self.src, self.dest, self.seq_no, self.ack_no,
        )?;
        if !self.payload.is_empty() {
            write!(fmt, " len={}", self.payload.len())?;
        }

        Ok(())
    }
}

impl DatagramBuilder {
    /// Constructs a new datagram builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the datagram and computes its checksum.
    ///
    /// # Panics
    ///
    /// Panics if the flag, the sequence number or one of the addresses
    /// wasn't set.
    pub fn build(self) -> Datagram {
        let mut datagram = Datagram {
            ack_no: self.ack_no,
            checksum: 0,
            dest: self.dest.expect("missing destination address"),
            flag: self.flag.expect("missing flag"),
            payload: self.payload,
            seq_no: self.seq_no.expect("missing sequence number"),
            src: self.src.expect("missing source address"),
        };
        datagram.checksum = datagram.calculate_checksum();

        datagram
    }

    /// Sets the acknowledgment number.
    pub fn ack_no(mut self, ack_no: u32) -> Self {
        self.ack_no = ack_no;
        self
    }

    /// Sets the destination address.
    pub fn dest(mut self, addr: SocketAddr) -> Self {
        self.dest = Some(addr);
        self
    }

    /// Sets the flag.
    pub fn flag(mut self, flag: Flag) -> Self {
        self.flag = Some(flag);
        self
    }

    /// Sets the payload.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sets the sequence number.
    pub fn seq_no(mut self, seq_no: u32) -> Self {
        self.seq_no = Some(seq_no);
        self
    }

    /// Sets the source address.
    pub fn src(mut self, addr: SocketAddr) -> Self {
        self.src = Some(addr);
        self
    }
}

fn read_addr(buf: &mut impl Buf) -> io::Result<SocketAddr> {
    assert_size!(buf, 1);
    let ip = match buf.get_u8() {
        FAMILY_V4 => {
            assert_size!(buf, 4 + U16_SIZE);
            let mut octets = [0; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            assert_size!(buf, 16 + U16_SIZE);
            let mut octets = [0; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => invalid_data!("unknown address family {}", family),
    };

    Ok(SocketAddr::new(ip, buf.get_u16_be()))
}

fn write_addr(addr: &SocketAddr, w: &mut impl Write) -> io::Result<()> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            w.write_u8(FAMILY_V4)?;
            w.write_all(&ip.octets())?;
        }
        IpAddr::V6(ip) => {
            w.write_u8(FAMILY_V6)?;
            w.write_all(&ip.octets())?;
        }
    }

    w.write_u16::<NetworkEndian>(addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    fn data_packet() -> Datagram {
        DatagramBuilder::new()
            .flag(Flag::None)
            .seq_no(42)
            .src("10.0.0.1:4000".parse().unwrap())
            .dest("[::1]:9000".parse().unwrap())
            .payload("Hello World")
            .build()
    }

    #[test]
    fn binary_len() {
        let packet = data_packet();
        assert_eq!(packet.binary_len(), packet.to_vec().len());
    }

    #[test]
    fn builder_computes_checksum() {
        let packet = data_packet();

        assert_ne!(packet.checksum, 0);
        assert!(packet.has_valid_checksum());
    }

    #[test]
    fn checksum_covers_fields() {
        let mut packet = data_packet();
        packet.seq_no += 1;
        assert!(!packet.has_valid_checksum());

        let mut packet = data_packet();
        packet.src.set_port(4001);
        assert!(!packet.has_valid_checksum());

        let mut packet = data_packet();
        packet.payload.push('!');
        assert!(!packet.has_valid_checksum());
    }

    #[test]
    fn parsing() {
        let packet = data_packet();
        let mut serialized: Bytes = packet.to_vec().into();

        assert_eq!(packet, Datagram::read_from(&mut serialized).unwrap());
        assert!(serialized.is_empty());
    }

    #[test]
    fn parsing_keeps_corrupted_checksum() {
        let mut packet = data_packet();
        packet.checksum ^= 0xdead_beef;
        let mut serialized: Bytes = packet.to_vec().into();

        let parsed = Datagram::read_from(&mut serialized).unwrap();
        assert_eq!(parsed.checksum, packet.checksum);
        assert!(!parsed.has_valid_checksum());
    }

    /// Ensure we cannot read data from nothing.
    #[test]
    fn zero_input() {
        let mut data = Bytes::new();

        match Datagram::read_from(&mut data) {
            Ok(_) => panic!("Read datagram from empty data."),
            Err(ref e) if e.kind() != ErrorKind::UnexpectedEof => {
                panic!("Unexpected error kind")
            }
            _ => {}
        }
    }

    #[test]
    fn truncated_input() {
        let serialized = data_packet().to_vec();
        let mut truncated = Bytes::from(&serialized[..serialized.len() - 1]);

        let err = Datagram::read_from(&mut truncated).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unknown_flag() {
        let mut serialized = data_packet().to_vec();
        serialized[0] = 0x7f;

        let err = Datagram::read_from(&mut serialized.into()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn control_flags() {
        assert!(!Flag::None.is_control());
        assert!(Flag::Syn.is_control());
        assert!(Flag::SynAck.is_control());
        assert!(Flag::Ack.is_control());
        assert!(Flag::Fin.is_control());
    }

    #[test]
    #[should_panic]
    fn builder_requires_flag() {
        DatagramBuilder::new()
            .seq_no(1)
            .src("127.0.0.1:1".parse().unwrap())
            .dest("127.0.0.1:2".parse().unwrap())
            .build();
    }
}
