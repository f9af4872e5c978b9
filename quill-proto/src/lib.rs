//! Low-level protocol logic for an early-draft QUIC transport
//!
//! quill-proto contains a deterministic implementation of the QUIC draft-05 packet and frame
//! codecs plus the connection state machine that drives the cleartext handshake and protects
//! 1-RTT traffic. It performs no networking and reads no clocks: callers hand it datagrams and
//! timestamps, and collect the datagrams it wants sent.
//!
//! TLS and the AEAD primitives are supplied by the caller through [`crypto::Session`].
//!
//! The most important type is [`Connection`], which holds all state for a single connection.
//! The [`frame`], [`packet`] and [`packet_number`] modules expose the wire codecs on their own.

#![cfg_attr(test, allow(dead_code))]
// Fixes welcome:
#![allow(clippy::too_many_arguments)]

use std::{fmt, ops};

use bytes::{Buf, BufMut};

#[doc(hidden)]
pub mod coding;
use coding::Codec;

mod config;
pub use crate::config::ConnectionConfig;

mod connection;
pub use crate::connection::{Connection, Event, StateType};

pub mod crypto;

mod error;
pub use crate::error::Error;

pub mod frame;
pub use crate::frame::{ConnectionClose, Frame};

pub mod packet;
pub use crate::packet::{ConnectionId, Header, LongType, PacketNumber};

pub mod packet_number;

mod range_set;

#[cfg(test)]
mod tests;

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0xff00_0005;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Identifier for a stream within a particular connection
///
/// Stream 0 carries the TLS handshake.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for StreamId {
    fn from(x: u32) -> Self {
        Self(x)
    }
}

impl Codec for StreamId {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        u32::decode(buf).map(Self)
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf);
    }
}
