use std::{fmt, hash::Hasher, io};

use bytes::{Buf, BufMut};
use fnv::FnvHasher;
use rand::Rng;

use crate::{
    coding::{BufExt, BufMutExt},
    Error,
};

/// First-octet bit distinguishing long headers from short ones
pub const LONG_HEADER_FORM: u8 = 0x80;
/// Short-header bit signalling that a connection ID follows the first octet
pub const CONN_ID_PRESENT: u8 = 0x40;
/// Short-header key phase bit
pub const KEY_PHASE: u8 = 0x20;
const LONG_TYPE_MASK: u8 = 0x7f;
const SHORT_TYPE_MASK: u8 = 0x1f;

/// Encoded size of every long header
pub const LONG_HEADER_LEN: usize = 17;
/// Largest possible short header: flags, connection ID and a 4-byte packet number
pub const MAX_SHORT_HEADER_LEN: usize = 13;
/// Length of the integrity digest trailing each cleartext packet
pub const PACKET_HASH_LEN: usize = 8;

/// A decoded packet header
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Header {
    Long {
        ty: LongType,
        conn_id: ConnectionId,
        /// Long headers always carry the low 32 bits of the packet number
        number: u32,
        version: u32,
    },
    Short {
        conn_id: Option<ConnectionId>,
        number: PacketNumber,
        key_phase: bool,
    },
}

impl Header {
    /// Decode either header form, selected by the form bit of the first octet
    ///
    /// Returns the header and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), Error> {
        match buf.first() {
            Some(b) if b & LONG_HEADER_FORM != 0 => Self::decode_long(buf),
            Some(_) => Self::decode_short(buf),
            None => Err(Error::InvalidArgument),
        }
    }

    pub fn decode_long(buf: &[u8]) -> Result<(Self, usize), Error> {
        if buf.len() < LONG_HEADER_LEN || buf[0] & LONG_HEADER_FORM == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut r = io::Cursor::new(buf);
        let first = r.get::<u8>()?;
        let conn_id = ConnectionId(r.get()?);
        let number = r.get()?;
        let version = r.get()?;
        let ty = match version {
            0 => LongType::VersionNegotiation,
            _ => LongType::from_byte(first & LONG_TYPE_MASK)?,
        };
        let hdr = Self::Long {
            ty,
            conn_id,
            number,
            version,
        };
        Ok((hdr, LONG_HEADER_LEN))
    }

    pub fn decode_short(buf: &[u8]) -> Result<(Self, usize), Error> {
        let first = *buf.first().ok_or(Error::InvalidArgument)?;
        if first & LONG_HEADER_FORM != 0 {
            return Err(Error::InvalidArgument);
        }
        let has_cid = first & CONN_ID_PRESENT != 0;
        let prefix_len = if has_cid { 9 } else { 1 };
        if buf.len() < prefix_len {
            return Err(Error::InvalidArgument);
        }
        let pn_len = PacketNumber::decode_len(first & SHORT_TYPE_MASK)?;

        let mut r = io::Cursor::new(&buf[1..]);
        let conn_id = match has_cid {
            true => Some(ConnectionId(r.get()?)),
            false => None,
        };
        let number = PacketNumber::decode(pn_len, &mut r)?;
        let hdr = Self::Short {
            conn_id,
            number,
            key_phase: first & KEY_PHASE != 0,
        };
        Ok((hdr, prefix_len + pn_len))
    }

    /// Exact number of bytes [`Header::encode`] writes
    pub fn len(&self) -> usize {
        match *self {
            Self::Long { .. } => LONG_HEADER_LEN,
            Self::Short {
                conn_id, number, ..
            } => 1 + conn_id.map_or(0, |_| 8) + number.len(),
        }
    }

    /// Write the header to the front of `out`, returning the number of bytes written
    ///
    /// Nothing is written if `out` is too small.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, Error> {
        let len = self.len();
        if out.len() < len {
            return Err(Error::NoBuffer);
        }
        let mut w = &mut out[..len];
        match *self {
            Self::Long {
                ty,
                conn_id,
                number,
                version,
            } => {
                w.write(LONG_HEADER_FORM | u8::from(ty));
                w.write(conn_id.0);
                w.write(number);
                w.write(version);
            }
            Self::Short {
                conn_id,
                number,
                key_phase,
            } => {
                let mut first = number.short_type();
                if conn_id.is_some() {
                    first |= CONN_ID_PRESENT;
                }
                if key_phase {
                    first |= KEY_PHASE;
                }
                w.write(first);
                if let Some(cid) = conn_id {
                    w.write(cid.0);
                }
                number.encode(&mut w);
            }
        }
        Ok(len)
    }

    pub fn is_long(&self) -> bool {
        matches!(*self, Self::Long { .. })
    }

    pub fn conn_id(&self) -> Option<ConnectionId> {
        match *self {
            Self::Long { conn_id, .. } => Some(conn_id),
            Self::Short { conn_id, .. } => conn_id,
        }
    }

    /// The packet number as it appeared on the wire, and how many bits it holds
    pub fn truncated_number(&self) -> (u64, u32) {
        match *self {
            Self::Long { number, .. } => (number.into(), 32),
            Self::Short { number, .. } => (number.value(), number.bits()),
        }
    }
}

/// Long header packet types
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LongType {
    VersionNegotiation,
    ClientInitial,
    ServerStatelessRetry,
    ServerCleartext,
    ClientCleartext,
    ZeroRttProtected,
    OneRttKeyPhase0,
    OneRttKeyPhase1,
    PublicReset,
}

impl LongType {
    fn from_byte(b: u8) -> Result<Self, Error> {
        use LongType::*;
        Ok(match b {
            0x01 => VersionNegotiation,
            0x02 => ClientInitial,
            0x03 => ServerStatelessRetry,
            0x04 => ServerCleartext,
            0x05 => ClientCleartext,
            0x06 => ZeroRttProtected,
            0x07 => OneRttKeyPhase0,
            0x08 => OneRttKeyPhase1,
            0x09 => PublicReset,
            _ => return Err(Error::UnknownPacketType),
        })
    }

    /// Whether packets of this type carry handshake data protected only by a digest
    pub fn is_cleartext(self) -> bool {
        use LongType::*;
        matches!(
            self,
            ClientInitial | ServerStatelessRetry | ServerCleartext | ClientCleartext
        )
    }
}

impl From<LongType> for u8 {
    fn from(ty: LongType) -> u8 {
        use LongType::*;
        match ty {
            VersionNegotiation => 0x01,
            ClientInitial => 0x02,
            ServerStatelessRetry => 0x03,
            ServerCleartext => 0x04,
            ClientCleartext => 0x05,
            ZeroRttProtected => 0x06,
            OneRttKeyPhase0 => 0x07,
            OneRttKeyPhase1 => 0x08,
            PublicReset => 0x09,
        }
    }
}

/// A truncated packet number as carried by a short header
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U32(u32),
}

impl PacketNumber {
    /// Narrowest encoding of `n` that the peer can expand unambiguously given that it has
    /// acknowledged `largest_acked`
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = n.saturating_sub(largest_acked).saturating_mul(2);
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else {
            Self::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U32(_) => 4,
        }
    }

    pub fn bits(self) -> u32 {
        self.len() as u32 * 8
    }

    pub fn value(self) -> u64 {
        use PacketNumber::*;
        match self {
            U8(x) => x.into(),
            U16(x) => x.into(),
            U32(x) => x.into(),
        }
    }

    pub fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U32(x) => w.write(x),
        }
    }

    pub fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, Error> {
        use PacketNumber::*;
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            4 => U32(r.get()?),
            _ => return Err(Error::Internal),
        };
        Ok(pn)
    }

    /// Packet number width selected by a short header type tag
    fn decode_len(ty: u8) -> Result<usize, Error> {
        match ty {
            0x01 => Ok(1),
            0x02 => Ok(2),
            0x03 => Ok(4),
            _ => Err(Error::UnknownPacketType),
        }
    }

    fn short_type(self) -> u8 {
        use PacketNumber::*;
        match self {
            U8(_) => 0x01,
            U16(_) => 0x02,
            U32(_) => 0x03,
        }
    }
}

/// Protocol-level identifier for a connection
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn random<R: Rng>(rng: &mut R) -> Self {
        Self(rng.gen())
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Decode the list of versions a server offers in a version negotiation packet
pub fn decode_version_negotiation(payload: &[u8]) -> Result<Vec<u32>, Error> {
    if payload.len() % 4 != 0 {
        return Err(Error::InvalidArgument);
    }
    let mut versions = Vec::with_capacity(payload.len() / 4);
    let mut r = io::Cursor::new(payload);
    while r.has_remaining() {
        versions.push(r.get()?);
    }
    Ok(versions)
}

/// FNV-1a digest protecting cleartext packets
fn packet_hash(data: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(data);
    hasher.finish()
}

/// Append the integrity digest of everything already in `packet`
pub(crate) fn append_packet_hash(packet: &mut Vec<u8>) {
    let hash = packet_hash(packet);
    packet.write(hash);
}

/// Verify and strip the trailing integrity digest of a cleartext packet
pub(crate) fn verify_packet_hash(packet: &[u8]) -> Result<&[u8], Error> {
    if packet.len() < LONG_HEADER_LEN + PACKET_HASH_LEN {
        return Err(Error::InvalidArgument);
    }
    let (body, trailer) = packet.split_at(packet.len() - PACKET_HASH_LEN);
    if io::Cursor::new(trailer).get::<u64>()? != packet_hash(body) {
        return Err(Error::BadPacketHash);
    }
    Ok(body)
}
