use std::fmt;

use crate::{Error, VERSION};

/// Parameters governing a connection
///
/// Default values match what the protocol version this crate speaks expects of a client on the
/// public internet; they rarely need changing except in tests.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub(crate) version: u32,
    pub(crate) max_packet_size: u16,
    pub(crate) min_initial_size: u16,
    pub(crate) crypto_buffer_size: usize,
    pub(crate) initial_packet_number_limit: u64,
}

impl ConnectionConfig {
    /// Protocol version advertised in long headers
    pub fn version(&mut self, value: u32) -> &mut Self {
        self.version = value;
        self
    }

    /// Largest datagram the connection will produce
    pub fn max_packet_size(&mut self, value: u16) -> &mut Self {
        self.max_packet_size = value;
        self
    }

    /// Size to which every Client Initial packet is padded
    ///
    /// Must not exceed `max_packet_size`.
    pub fn min_initial_size(&mut self, value: u16) -> &mut Self {
        self.min_initial_size = value;
        self
    }

    /// Maximum number of handshake bytes buffered in either direction
    pub fn crypto_buffer_size(&mut self, value: usize) -> &mut Self {
        self.crypto_buffer_size = value;
        self
    }

    /// Exclusive upper bound of the range the first packet number is drawn from
    ///
    /// Must be nonzero.
    pub fn initial_packet_number_limit(&mut self, value: u64) -> &mut Self {
        self.initial_packet_number_limit = value;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_packet_size < MIN_PACKET_SIZE
            || self.min_initial_size > self.max_packet_size
            || self.initial_packet_number_limit == 0
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// Smallest `max_packet_size` that leaves room for a header and a useful payload
const MIN_PACKET_SIZE: u16 = 64;

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: VERSION,
            max_packet_size: 1232,
            min_initial_size: 1200,
            crypto_buffer_size: 64 * 1024,
            initial_packet_number_limit: 1 << 31,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ConnectionConfig")
            .field("version", &format_args!("{:#010x}", self.version))
            .field("max_packet_size", &self.max_packet_size)
            .field("min_initial_size", &self.min_initial_size)
            .field("crypto_buffer_size", &self.crypto_buffer_size)
            .field(
                "initial_packet_number_limit",
                &self.initial_packet_number_limit,
            )
            .finish()
    }
}
