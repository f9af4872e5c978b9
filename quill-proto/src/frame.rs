use std::{fmt, mem, ops::RangeInclusive};

use bytes::{Buf, BufMut, Bytes};

use crate::{
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    packet::ConnectionId,
    Error, StreamId,
};

/// A frame type tag
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u8);

impl FrameType {
    fn stream(self) -> bool {
        STREAM_TYS.contains(&self.0)
    }

    fn ack(self) -> bool {
        ACK_TYS.contains(&self.0)
    }
}

impl From<FrameType> for u8 {
    fn from(x: FrameType) -> Self {
        x.0
    }
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if ACK_TYS.contains(&x) => f.write_str("ACK"),
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

frame_types! {
    PADDING = 0x00,
    RST_STREAM = 0x01,
    CONNECTION_CLOSE = 0x02,
    GOAWAY = 0x03,
    MAX_DATA = 0x04,
    MAX_STREAM_DATA = 0x05,
    MAX_STREAM_ID = 0x06,
    PING = 0x07,
    BLOCKED = 0x08,
    STREAM_BLOCKED = 0x09,
    STREAM_ID_NEEDED = 0x0a,
    NEW_CONNECTION_ID = 0x0b,
}

const ACK_TYS: RangeInclusive<u8> = 0xa0..=0xbf;
const STREAM_TYS: RangeInclusive<u8> = 0xc0..=0xff;

const ACK_N_BIT: u8 = 0x10;
const STREAM_FIN_BIT: u8 = 0x20;
const STREAM_SS_MASK: u8 = 0x18;
const STREAM_OO_MASK: u8 = 0x06;
const STREAM_D_BIT: u8 = 0x01;

/// A single unit of content within a packet payload
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    /// A run of `len` consecutive PADDING bytes
    Padding { len: usize },
    Ping,
    Stream(Stream),
    Ack(Ack),
    ResetStream(ResetStream),
    ConnectionClose(ConnectionClose),
    GoAway(GoAway),
    MaxData(u64),
    MaxStreamData { id: StreamId, max_data: u64 },
    MaxStreamId(StreamId),
    Blocked,
    StreamBlocked(StreamId),
    StreamIdNeeded,
    NewConnectionId { sequence: u16, id: ConnectionId },
}

impl Frame {
    /// Decode the frame starting at `payload[0]`
    ///
    /// Returns the frame and the number of bytes it occupied. A PADDING tag consumes the whole
    /// run of PADDING bytes that follows it.
    pub fn decode(payload: &Bytes) -> Result<(Self, usize), Error> {
        decode_prefix(payload, Self::decode_from)
    }

    fn decode_from(r: &mut Bytes) -> Result<Self, Error> {
        let ty = FrameType(*r.first().ok_or(Error::InvalidArgument)?);
        if ty.stream() {
            return Ok(Self::Stream(Stream::decode_from(r)?));
        }
        if ty.ack() {
            return Ok(Self::Ack(Ack::decode_from(r)?));
        }
        Ok(match ty {
            FrameType::PADDING => {
                let len = decode_padding(r)?;
                r.advance(len);
                Self::Padding { len }
            }
            FrameType::RST_STREAM => Self::ResetStream(ResetStream::decode_from(r)?),
            FrameType::CONNECTION_CLOSE => {
                Self::ConnectionClose(ConnectionClose::decode_from(r)?)
            }
            FrameType::GOAWAY => Self::GoAway(GoAway::decode_from(r)?),
            _ => {
                r.advance(1);
                match ty {
                    FrameType::MAX_DATA => Self::MaxData(r.get()?),
                    FrameType::MAX_STREAM_DATA => Self::MaxStreamData {
                        id: r.get()?,
                        max_data: r.get()?,
                    },
                    FrameType::MAX_STREAM_ID => Self::MaxStreamId(r.get()?),
                    FrameType::PING => Self::Ping,
                    FrameType::BLOCKED => Self::Blocked,
                    FrameType::STREAM_BLOCKED => Self::StreamBlocked(r.get()?),
                    FrameType::STREAM_ID_NEEDED => Self::StreamIdNeeded,
                    FrameType::NEW_CONNECTION_ID => Self::NewConnectionId {
                        sequence: r.get()?,
                        id: ConnectionId::new(r.get()?),
                    },
                    _ => return Err(Error::InvalidArgument),
                }
            }
        })
    }

    pub fn ty(&self) -> FrameType {
        match *self {
            Self::Padding { .. } => FrameType::PADDING,
            Self::Ping => FrameType::PING,
            Self::Stream(ref x) => FrameType(x.type_byte()),
            Self::Ack(ref x) => FrameType(x.type_byte()),
            Self::ResetStream(_) => FrameType::RST_STREAM,
            Self::ConnectionClose(_) => FrameType::CONNECTION_CLOSE,
            Self::GoAway(_) => FrameType::GOAWAY,
            Self::MaxData(_) => FrameType::MAX_DATA,
            Self::MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            Self::MaxStreamId(_) => FrameType::MAX_STREAM_ID,
            Self::Blocked => FrameType::BLOCKED,
            Self::StreamBlocked(_) => FrameType::STREAM_BLOCKED,
            Self::StreamIdNeeded => FrameType::STREAM_ID_NEEDED,
            Self::NewConnectionId { .. } => FrameType::NEW_CONNECTION_ID,
        }
    }

    /// Whether receipt of this frame obliges the receiver to acknowledge the packet
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Self::Ack(_) | Self::Padding { .. })
    }

    /// Exact number of bytes [`Frame::encode`] writes, or why the frame cannot be encoded
    pub fn encoded_len(&self) -> Result<usize, Error> {
        Ok(match *self {
            Self::Padding { len } => len,
            Self::Ping | Self::Blocked | Self::StreamIdNeeded => 1,
            Self::Stream(ref x) => x.encoded_len(),
            Self::Ack(ref x) => x.encoded_len()?,
            Self::ResetStream(_) => ResetStream::SIZE,
            Self::ConnectionClose(ref x) => x.encoded_len()?,
            Self::GoAway(_) => GoAway::SIZE,
            Self::MaxData(_) => 1 + 8,
            Self::MaxStreamData { .. } => 1 + 4 + 8,
            Self::MaxStreamId(_) | Self::StreamBlocked(_) => 1 + 4,
            Self::NewConnectionId { .. } => 1 + 2 + 8,
        })
    }

    /// Write the frame to the front of `out`, using the narrowest fields able to hold each value
    ///
    /// Returns the number of bytes written. Nothing is written on failure.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, Error> {
        let len = self.encoded_len()?;
        if out.len() < len {
            return Err(Error::NoBuffer);
        }
        let mut w = &mut out[..len];
        self.encode_unchecked(&mut w);
        debug_assert!(w.is_empty());
        Ok(len)
    }

    fn encode_unchecked<W: BufMut>(&self, w: &mut W) {
        match *self {
            Self::Padding { len } => w.put_bytes(0, len),
            Self::Stream(ref x) => x.encode_unchecked(w),
            Self::Ack(ref x) => x.encode_unchecked(w),
            Self::ResetStream(ref x) => x.encode(w),
            Self::ConnectionClose(ref x) => x.encode_unchecked(w),
            Self::GoAway(ref x) => x.encode(w),
            _ => {
                w.write(u8::from(self.ty()));
                match *self {
                    Self::MaxData(max) => w.write(max),
                    Self::MaxStreamData { id, max_data } => {
                        w.write(id);
                        w.write(max_data);
                    }
                    Self::MaxStreamId(id) | Self::StreamBlocked(id) => w.write(id),
                    Self::NewConnectionId { sequence, id } => {
                        w.write(sequence);
                        w.write(id.value());
                    }
                    _ => {}
                }
            }
        }
    }
}

fn decode_prefix<T>(
    payload: &Bytes,
    f: impl FnOnce(&mut Bytes) -> Result<T, Error>,
) -> Result<(T, usize), Error> {
    let mut r = payload.clone();
    let x = f(&mut r)?;
    Ok((x, payload.len() - r.len()))
}

fn take(r: &mut Bytes, len: usize) -> Result<Bytes, UnexpectedEnd> {
    if r.len() < len {
        return Err(UnexpectedEnd);
    }
    Ok(r.split_to(len))
}

fn expect_type(r: &mut Bytes, ty: FrameType) -> Result<(), Error> {
    match r.get::<u8>()? == ty.0 {
        true => Ok(()),
        false => Err(Error::InvalidArgument),
    }
}

/// Count the run of PADDING bytes at the front of `payload`
pub fn decode_padding(payload: &[u8]) -> Result<usize, Error> {
    if payload.first() != Some(&FrameType::PADDING.0) {
        return Err(Error::InvalidArgument);
    }
    Ok(payload
        .iter()
        .take_while(|&&b| b == FrameType::PADDING.0)
        .count())
}

/// Application data carried on a stream
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl Stream {
    pub fn decode(payload: &Bytes) -> Result<(Self, usize), Error> {
        decode_prefix(payload, Self::decode_from)
    }

    fn decode_from(r: &mut Bytes) -> Result<Self, Error> {
        let ty = r.get::<u8>()?;
        if !STREAM_TYS.contains(&ty) {
            return Err(Error::InvalidArgument);
        }
        let id_len = 1 + ((ty & STREAM_SS_MASK) >> 3) as usize;
        let id = StreamId(r.get_uint_be(id_len)? as u32);
        let offset = match offset_width((ty & STREAM_OO_MASK) >> 1) {
            0 => 0,
            width => r.get_uint_be(width)?,
        };
        let data = match ty & STREAM_D_BIT != 0 {
            true => {
                let len = r.get::<u16>()?;
                take(r, len.into())?
            }
            false => mem::take(r),
        };
        Ok(Self {
            id,
            offset,
            fin: ty & STREAM_FIN_BIT != 0,
            data,
        })
    }

    fn id_len(&self) -> usize {
        match self.id.0 {
            x if x < 1 << 8 => 1,
            x if x < 1 << 16 => 2,
            x if x < 1 << 24 => 3,
            _ => 4,
        }
    }

    fn offset_len(&self) -> usize {
        match self.offset {
            0 => 0,
            x if x < 1 << 16 => 2,
            x if x < 1 << 32 => 4,
            _ => 8,
        }
    }

    /// Whether the data length is written explicitly; larger data runs to the end of the packet
    fn has_len(&self) -> bool {
        self.data.len() <= u16::MAX as usize
    }

    fn type_byte(&self) -> u8 {
        let offset_bits = match self.offset_len() {
            0 => 0b00,
            2 => 0b01,
            4 => 0b10,
            _ => 0b11,
        };
        let mut ty = STREAM_TYS.start() | ((self.id_len() as u8 - 1) << 3) | (offset_bits << 1);
        if self.fin {
            ty |= STREAM_FIN_BIT;
        }
        if self.has_len() {
            ty |= STREAM_D_BIT;
        }
        ty
    }

    fn encoded_len(&self) -> usize {
        let len_field = if self.has_len() { 2 } else { 0 };
        1 + self.id_len() + self.offset_len() + len_field + self.data.len()
    }

    fn encode_unchecked<W: BufMut>(&self, w: &mut W) {
        w.write(self.type_byte());
        w.write_uint_be(self.id.0.into(), self.id_len());
        if self.offset_len() != 0 {
            w.write_uint_be(self.offset, self.offset_len());
        }
        if self.has_len() {
            w.write(self.data.len() as u16);
        }
        w.put_slice(&self.data);
    }
}

fn offset_width(bits: u8) -> usize {
    match bits {
        0 => 0,
        x => 1 << x,
    }
}

/// An acknowledgement of received packets
///
/// Packets `largest + 1 - first_block ..= largest` are acknowledged, then each [`AckBlock`] in
/// turn skips `gap` packets and acknowledges the `len` below them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ack {
    pub largest: u64,
    /// Microseconds between receipt of `largest` and sending this acknowledgement
    pub delay: u16,
    pub first_block: u64,
    pub blocks: Vec<AckBlock>,
    pub timestamps: Vec<AckTimestamp>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckBlock {
    pub gap: u8,
    pub len: u64,
}

/// Receive time of an acknowledged packet
///
/// The first entry's `time` is absolute and must fit 32 bits; each later entry is relative to
/// its predecessor and must fit 16 bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AckTimestamp {
    /// Distance below the largest acknowledged packet number
    pub delta: u8,
    pub time: u32,
}

impl Ack {
    pub fn decode(payload: &Bytes) -> Result<(Self, usize), Error> {
        decode_prefix(payload, Self::decode_from)
    }

    fn decode_from(r: &mut Bytes) -> Result<Self, Error> {
        let ty = r.get::<u8>()?;
        if !ACK_TYS.contains(&ty) {
            return Err(Error::InvalidArgument);
        }
        let num_blocks = match ty & ACK_N_BIT != 0 {
            true => r.get::<u8>()?,
            false => 0,
        };
        let num_ts = r.get::<u8>()?;
        let largest_len = coding::pow2_width_from_bits(ty >> 2);
        let block_len = coding::pow2_width_from_bits(ty);

        let largest = r.get_uint_be(largest_len)?;
        let delay = r.get()?;
        let first_block = r.get_uint_be(block_len)?;
        let mut blocks = Vec::with_capacity(num_blocks.into());
        for _ in 0..num_blocks {
            blocks.push(AckBlock {
                gap: r.get()?,
                len: r.get_uint_be(block_len)?,
            });
        }
        let mut timestamps = Vec::with_capacity(num_ts.into());
        for i in 0..num_ts {
            let delta = r.get()?;
            let time = match i {
                0 => r.get::<u32>()?,
                _ => r.get::<u16>()?.into(),
            };
            timestamps.push(AckTimestamp { delta, time });
        }
        Ok(Self {
            largest,
            delay,
            first_block,
            blocks,
            timestamps,
        })
    }

    /// Acknowledged packet numbers, highest range first
    ///
    /// Iteration stops early if the ranges would run below zero.
    pub fn iter(&self) -> AckIter<'_> {
        AckIter {
            next: self.largest.checked_add(1),
            first: Some(self.first_block),
            blocks: self.blocks.iter(),
        }
    }

    /// Lowest acknowledged packet number, if every range is representable
    pub fn smallest(&self) -> Option<u64> {
        let mut low = self.largest.checked_add(1)?.checked_sub(self.first_block)?;
        for block in &self.blocks {
            low = low.checked_sub(u64::from(block.gap))?.checked_sub(block.len)?;
        }
        Some(low)
    }

    fn block_len(&self) -> usize {
        let max = self
            .blocks
            .iter()
            .map(|b| b.len)
            .fold(self.first_block, u64::max);
        coding::pow2_width(max)
    }

    fn type_byte(&self) -> u8 {
        let mut ty = ACK_TYS.start() | coding::pow2_width_bits(self.block_len());
        ty |= coding::pow2_width_bits(coding::pow2_width(self.largest)) << 2;
        if !self.blocks.is_empty() {
            ty |= ACK_N_BIT;
        }
        ty
    }

    fn encoded_len(&self) -> Result<usize, Error> {
        if self.blocks.len() > u8::MAX as usize || self.timestamps.len() > u8::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        if self.timestamps.iter().skip(1).any(|ts| ts.time > u32::from(u16::MAX)) {
            return Err(Error::InvalidArgument);
        }
        let block_len = self.block_len();
        let mut len = 1 + 1 + coding::pow2_width(self.largest) + 2 + block_len;
        if !self.blocks.is_empty() {
            len += 1 + self.blocks.len() * (1 + block_len);
        }
        if !self.timestamps.is_empty() {
            len += 5 + (self.timestamps.len() - 1) * 3;
        }
        Ok(len)
    }

    fn encode_unchecked<W: BufMut>(&self, w: &mut W) {
        let block_len = self.block_len();
        w.write(self.type_byte());
        if !self.blocks.is_empty() {
            w.write(self.blocks.len() as u8);
        }
        w.write(self.timestamps.len() as u8);
        w.write_uint_be(self.largest, coding::pow2_width(self.largest));
        w.write(self.delay);
        w.write_uint_be(self.first_block, block_len);
        for block in &self.blocks {
            w.write(block.gap);
            w.write_uint_be(block.len, block_len);
        }
        for (i, ts) in self.timestamps.iter().enumerate() {
            w.write(ts.delta);
            match i {
                0 => w.write(ts.time),
                _ => w.write(ts.time as u16),
            }
        }
    }
}

impl<'a> IntoIterator for &'a Ack {
    type Item = RangeInclusive<u64>;
    type IntoIter = AckIter<'a>;

    fn into_iter(self) -> AckIter<'a> {
        self.iter()
    }
}

pub struct AckIter<'a> {
    /// One past the highest packet number the next range may cover
    next: Option<u64>,
    first: Option<u64>,
    blocks: std::slice::Iter<'a, AckBlock>,
}

impl Iterator for AckIter<'_> {
    type Item = RangeInclusive<u64>;

    fn next(&mut self) -> Option<RangeInclusive<u64>> {
        loop {
            let top = self.next?;
            let len = match self.first.take() {
                Some(len) => len,
                None => {
                    let block = self.blocks.next()?;
                    let top = top.checked_sub(block.gap.into());
                    self.next = top;
                    let top = top?;
                    self.next = top.checked_sub(block.len);
                    if block.len == 0 {
                        continue;
                    }
                    return Some(self.next?..=top - 1);
                }
            };
            self.next = top.checked_sub(len);
            if len == 0 {
                continue;
            }
            return Some(self.next?..=top - 1);
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResetStream {
    pub id: StreamId,
    pub error_code: u32,
    pub final_offset: u64,
}

impl ResetStream {
    const SIZE: usize = 1 + 4 + 4 + 8;

    pub fn decode(payload: &Bytes) -> Result<(Self, usize), Error> {
        decode_prefix(payload, Self::decode_from)
    }

    fn decode_from(r: &mut Bytes) -> Result<Self, Error> {
        expect_type(r, FrameType::RST_STREAM)?;
        Ok(Self {
            id: r.get()?,
            error_code: r.get()?,
            final_offset: r.get()?,
        })
    }

    fn encode<W: BufMut>(&self, w: &mut W) {
        w.write(FrameType::RST_STREAM.0);
        w.write(self.id);
        w.write(self.error_code);
        w.write(self.final_offset);
    }
}

/// Immediate shutdown of the connection, with a reason phrase for diagnostics
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionClose {
    pub error_code: u32,
    pub reason: Bytes,
}

impl ConnectionClose {
    pub fn decode(payload: &Bytes) -> Result<(Self, usize), Error> {
        decode_prefix(payload, Self::decode_from)
    }

    fn decode_from(r: &mut Bytes) -> Result<Self, Error> {
        expect_type(r, FrameType::CONNECTION_CLOSE)?;
        let error_code = r.get()?;
        let len = r.get::<u16>()?;
        Ok(Self {
            error_code,
            reason: take(r, len.into())?,
        })
    }

    fn encoded_len(&self) -> Result<usize, Error> {
        if self.reason.len() > u16::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        Ok(1 + 4 + 2 + self.reason.len())
    }

    fn encode_unchecked<W: BufMut>(&self, w: &mut W) {
        w.write(FrameType::CONNECTION_CLOSE.0);
        w.write(self.error_code);
        w.write(self.reason.len() as u16);
        w.put_slice(&self.reason);
    }
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.error_code)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GoAway {
    pub largest_client_stream_id: StreamId,
    pub largest_server_stream_id: StreamId,
}

impl GoAway {
    const SIZE: usize = 1 + 4 + 4;

    pub fn decode(payload: &Bytes) -> Result<(Self, usize), Error> {
        decode_prefix(payload, Self::decode_from)
    }

    fn decode_from(r: &mut Bytes) -> Result<Self, Error> {
        expect_type(r, FrameType::GOAWAY)?;
        Ok(Self {
            largest_client_stream_id: r.get()?,
            largest_server_stream_id: r.get()?,
        })
    }

    fn encode<W: BufMut>(&self, w: &mut W) {
        w.write(FrameType::GOAWAY.0);
        w.write(self.largest_client_stream_id);
        w.write(self.largest_server_stream_id);
    }
}

/// Iterator over the frames of a packet payload
pub struct Iter {
    bytes: Bytes,
}

impl Iter {
    pub fn new(payload: Bytes) -> Self {
        Self { bytes: payload }
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match Frame::decode_from(&mut self.bytes) {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // Corrupt frame, skip it and everything that follows
                self.bytes.clear();
                Some(Err(e))
            }
        }
    }
}
