use std::{collections::VecDeque, time::Instant};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, trace_span, warn};

use crate::{
    config::ConnectionConfig,
    crypto::{self, CryptoContext, PacketKey, Session},
    frame::{self, Ack, ConnectionClose, Frame, Stream},
    packet::{
        append_packet_hash, decode_version_negotiation, verify_packet_hash, ConnectionId, Header,
        LongType, PacketNumber, LONG_HEADER_LEN, PACKET_HASH_LEN,
    },
    packet_number,
    range_set::RangeSet,
    Error, Side, StreamId,
};

mod handshake_buffer;
use handshake_buffer::HandshakeBuffer;

mod state;
use state::State;
pub use state::StateType;

/// Stream carrying TLS handshake messages
const HANDSHAKE_STREAM: StreamId = StreamId(0);
/// Most received packet number runs remembered for acknowledgement
const MAX_ACK_RANGES: usize = 32;

/// Protocol state and logic for a single QUIC connection
///
/// Objects of this type receive datagrams through [`on_bytes_received`] and emit them through
/// [`produce_send_packet`]. Neither performs I/O: the caller owns the socket and timers. Things
/// the application should know about are queued as [`Event`]s, retrieved with [`poll`].
///
/// A connection is not internally synchronized; exactly one caller drives it at a time.
///
/// [`on_bytes_received`]: Connection::on_bytes_received
/// [`produce_send_packet`]: Connection::produce_send_packet
/// [`poll`]: Connection::poll
pub struct Connection {
    side: Side,
    config: ConnectionConfig,
    session: Box<dyn Session>,
    state: State,
    conn_id: ConnectionId,

    /// Set once the 1-RTT key schedule has run
    crypto: Option<CryptoContext>,
    tx_key: Option<PacketKey>,
    rx_key: Option<PacketKey>,

    /// Handshake bytes from TLS awaiting transmission
    handshake_tx: HandshakeBuffer,
    /// In-order handshake bytes from the peer awaiting TLS
    handshake_rx: HandshakeBuffer,
    /// Whether the client has sent its Client Initial packet
    initial_sent: bool,

    next_packet_number: u64,
    /// Highest packet number actually transmitted
    largest_sent: Option<u64>,
    /// Highest packet number the peer has acknowledged
    largest_acked: Option<u64>,
    /// Highest packet number successfully authenticated from the peer
    max_rx_packet_number: Option<u64>,
    received: RangeSet,
    /// Receipt time of the newest packet that obliges us to send an ACK
    ack_pending_since: Option<Instant>,

    pending_frames: VecDeque<Frame>,
    pending_close: Option<ConnectionClose>,
    /// Next offset to send on each application stream
    stream_offsets: FxHashMap<StreamId, u64>,
    events: VecDeque<Event>,
}

impl Connection {
    /// Begin connecting to a server
    ///
    /// Chooses a connection ID and initial packet number from `seed` and queues the first
    /// handshake flight TLS produces.
    pub fn client(
        config: ConnectionConfig,
        session: Box<dyn Session>,
        seed: [u8; 32],
    ) -> Result<Self, Error> {
        let mut rng = StdRng::from_seed(seed);
        let conn_id = ConnectionId::random(&mut rng);
        let mut this = Self::new(Side::Client, config, session, conn_id, &mut rng)?;
        this.state.move_to_handshaking();
        this.pull_handshake()?;
        debug!(cid = %this.conn_id, pn = this.next_packet_number, "connecting");
        Ok(this)
    }

    /// Prepare to accept a connection
    ///
    /// The connection stays idle until the client's first packet arrives, whose connection ID it
    /// adopts.
    pub fn server(
        config: ConnectionConfig,
        session: Box<dyn Session>,
        seed: [u8; 32],
    ) -> Result<Self, Error> {
        let mut rng = StdRng::from_seed(seed);
        Self::new(Side::Server, config, session, ConnectionId::new(0), &mut rng)
    }

    fn new(
        side: Side,
        config: ConnectionConfig,
        session: Box<dyn Session>,
        conn_id: ConnectionId,
        rng: &mut StdRng,
    ) -> Result<Self, Error> {
        config.validate()?;
        let next_packet_number = rng.gen_range(0..config.initial_packet_number_limit);
        Ok(Self {
            side,
            handshake_tx: HandshakeBuffer::new(config.crypto_buffer_size),
            handshake_rx: HandshakeBuffer::new(config.crypto_buffer_size),
            config,
            session,
            state: State::idle(),
            conn_id,
            crypto: None,
            tx_key: None,
            rx_key: None,
            initial_sent: false,
            next_packet_number,
            largest_sent: None,
            largest_acked: None,
            max_rx_packet_number: None,
            received: RangeSet::new(),
            ack_pending_since: None,
            pending_frames: VecDeque::new(),
            pending_close: None,
            stream_offsets: FxHashMap::default(),
            events: VecDeque::new(),
        })
    }

    /// Process one datagram received from the peer
    ///
    /// Errors other than [`Error::InvalidState`] are fatal: the connection moves to
    /// [`StateType::Failed`] and refuses all further work.
    pub fn on_bytes_received(&mut self, data: &[u8], now: Instant) -> Result<(), Error> {
        if self.state.is_terminal() {
            if self.state.error().is_some() {
                return Err(Error::InvalidState);
            }
            debug!(len = data.len(), "dropping packet while draining");
            return Ok(());
        }
        let span = trace_span!("recv", side = ?self.side, cid = %self.conn_id);
        let _guard = span.enter();
        let result = self.handle_packet(data, now);
        self.check_fatal(result)
    }

    /// Produce the next datagram to send, if anything is pending
    pub fn produce_send_packet(&mut self, now: Instant) -> Result<Option<Bytes>, Error> {
        if self.state.error().is_some() {
            return Err(Error::InvalidState);
        }
        if self.state.is_terminal() || self.state.is_idle() {
            return Ok(None);
        }
        let span = trace_span!("send", side = ?self.side, cid = %self.conn_id);
        let _guard = span.enter();
        let result = self.write_packet(now);
        self.check_fatal(result)
    }

    fn check_fatal<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(error = %e, "connection failed");
                self.state.move_to_failed(*e);
            }
        }
        result
    }

    /// Queue data on an application stream
    ///
    /// Stream 0 is reserved for the handshake.
    pub fn send_stream(&mut self, id: StreamId, data: Bytes, fin: bool) -> Result<(), Error> {
        if id == HANDSHAKE_STREAM {
            return Err(Error::InvalidArgument);
        }
        if !self.state.is_handshake_complete() {
            return Err(Error::InvalidState);
        }
        let offset = self.stream_offsets.entry(id).or_insert(0);
        let frame = Stream {
            id,
            offset: *offset,
            fin,
            data,
        };
        *offset += frame.data.len() as u64;
        trace!(stream = %id, offset = frame.offset, len = frame.data.len(), fin, "queued stream data");
        self.pending_frames.push_back(Frame::Stream(frame));
        Ok(())
    }

    /// Queue a control frame for transmission
    ///
    /// STREAM, ACK, PADDING and CONNECTION_CLOSE frames are produced by the connection itself
    /// and are refused here.
    pub fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if matches!(
            frame,
            Frame::Stream(_) | Frame::Ack(_) | Frame::Padding { .. } | Frame::ConnectionClose(_)
        ) {
            return Err(Error::InvalidArgument);
        }
        if !self.state.is_handshake_complete() {
            return Err(Error::InvalidState);
        }
        if frame.encoded_len()? > self.max_protected_payload() {
            return Err(Error::InvalidArgument);
        }
        self.pending_frames.push_back(frame);
        Ok(())
    }

    /// Close the connection, informing the peer with a CONNECTION_CLOSE frame
    ///
    /// Data not yet sent is discarded.
    pub fn close(&mut self, error_code: u32, reason: Bytes) -> Result<(), Error> {
        if !self.state.is_handshake_complete() {
            return Err(Error::InvalidState);
        }
        let frame = ConnectionClose { error_code, reason };
        if Frame::ConnectionClose(frame.clone()).encoded_len()? > self.max_protected_payload() {
            return Err(Error::InvalidArgument);
        }
        debug!(error_code, "closing");
        self.pending_frames.clear();
        self.pending_close = Some(frame);
        self.state.move_to_closing();
        Ok(())
    }

    /// Next event for the application, if any
    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> StateType {
        self.state.as_type()
    }

    /// The connection ID; zero for a server that has not yet heard from a client
    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.crypto.is_some()
    }

    /// Whether packet protection keys are installed for both directions
    pub fn has_1rtt(&self) -> bool {
        self.tx_key.is_some() && self.rx_key.is_some()
    }

    pub fn crypto_context(&self) -> Option<&CryptoContext> {
        self.crypto.as_ref()
    }

    /// Highest packet number authenticated from the peer so far
    pub fn max_rx_packet_number(&self) -> Option<u64> {
        self.max_rx_packet_number
    }

    fn handle_packet(&mut self, data: &[u8], now: Instant) -> Result<(), Error> {
        let (header, header_len) = Header::decode(data)?;
        match header {
            Header::Long {
                ty,
                conn_id,
                number,
                version,
            } => self.handle_long(ty, conn_id, number, version, data, now),
            Header::Short { .. } => self.handle_short(header, header_len, data, now),
        }
    }

    fn handle_long(
        &mut self,
        ty: LongType,
        conn_id: ConnectionId,
        number: u32,
        version: u32,
        data: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        use LongType::*;
        match ty {
            VersionNegotiation => {
                if self.side.is_server() || conn_id != self.conn_id {
                    debug!("ignoring version negotiation");
                    return Ok(());
                }
                let versions = decode_version_negotiation(&data[LONG_HEADER_LEN..])?;
                debug!(?versions, "version negotiation");
                self.events.push_back(Event::VersionNegotiation(versions));
                return Ok(());
            }
            ZeroRttProtected | PublicReset => {
                debug!(?ty, "dropping unsupported packet");
                return Ok(());
            }
            ServerStatelessRetry | OneRttKeyPhase0 | OneRttKeyPhase1 => {
                warn!(?ty, "unexpected long header packet");
                return Err(Error::Proto);
            }
            ClientInitial | ClientCleartext | ServerCleartext => {}
        }

        let expected = match self.side {
            Side::Client => ty == ServerCleartext,
            Side::Server if self.state.is_idle() => ty == ClientInitial,
            Side::Server => ty == ClientInitial || ty == ClientCleartext,
        };
        if !expected {
            warn!(?ty, "unexpected cleartext packet");
            return Err(Error::Proto);
        }
        if version != self.config.version {
            debug!(version, "dropping packet with unsupported version");
            return Ok(());
        }
        if !self.state.is_idle() && conn_id != self.conn_id {
            debug!(%conn_id, "dropping packet for another connection");
            return Ok(());
        }

        let body = verify_packet_hash(data)?;
        if self.state.is_idle() {
            self.conn_id = conn_id;
            self.state.move_to_handshaking();
            debug!(%conn_id, "accepted connection");
        }
        let Some(pn) = self.authenticate(number.into(), 32) else {
            return Ok(());
        };
        trace!(pn, len = data.len(), ?ty, "got cleartext packet");

        let payload = Bytes::copy_from_slice(&body[LONG_HEADER_LEN..]);
        let mut ack_eliciting = false;
        for result in frame::Iter::new(payload) {
            let frame = result?;
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding { .. } | Frame::Ping => {}
                Frame::Stream(stream) if stream.id == HANDSHAKE_STREAM => {
                    self.on_handshake_data(stream)?;
                }
                Frame::Ack(ack) => self.on_ack(ack)?,
                Frame::ConnectionClose(reason) => {
                    self.on_connection_close(reason);
                    return Ok(());
                }
                frame => {
                    warn!(ty = %frame.ty(), "frame not allowed in cleartext packet");
                    return Err(Error::Proto);
                }
            }
        }
        self.on_packet_received(pn, ack_eliciting, now);
        self.drive_handshake()
    }

    fn handle_short(
        &mut self,
        header: Header,
        header_len: usize,
        data: &[u8],
        now: Instant,
    ) -> Result<(), Error> {
        if header.conn_id().map_or(false, |cid| cid != self.conn_id) {
            debug!("dropping packet for another connection");
            return Ok(());
        }
        let (Some(rx), Some(crypto)) = (self.rx_key.as_ref(), self.crypto.as_ref()) else {
            debug!("dropping protected packet received before keys");
            return Err(Error::InvalidState);
        };
        let (truncated, bits) = header.truncated_number();
        let pn = packet_number::adjust(self.max_rx_packet_number.unwrap_or(0), truncated, bits);
        let (ad, sealed) = data.split_at(header_len);
        let mut payload = sealed.to_vec();
        self.session
            .decrypt(crypto.aead, rx.key(), &rx.nonce(pn), ad, &mut payload)?;
        let Some(pn) = self.authenticate(pn, 64) else {
            return Ok(());
        };
        trace!(pn, len = data.len(), "got protected packet");

        let mut ack_eliciting = false;
        for result in frame::Iter::new(payload.into()) {
            let frame = result?;
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding { .. } | Frame::Ping => {}
                Frame::Stream(stream) if stream.id == HANDSHAKE_STREAM => {
                    self.on_handshake_data(stream)?;
                }
                Frame::Ack(ack) => self.on_ack(ack)?,
                Frame::ConnectionClose(reason) => {
                    self.on_connection_close(reason);
                    return Ok(());
                }
                frame => {
                    trace!(ty = %frame.ty(), "got frame");
                    self.events.push_back(Event::Frame(frame));
                }
            }
        }
        self.on_packet_received(pn, ack_eliciting, now);
        self.drive_handshake()
    }

    /// Expand a packet number and account for it, returning `None` for duplicates
    fn authenticate(&mut self, truncated: u64, bits: u32) -> Option<u64> {
        let pn = packet_number::adjust(self.max_rx_packet_number.unwrap_or(0), truncated, bits);
        if self.received.contains(pn) {
            debug!(pn, "dropping duplicate packet");
            return None;
        }
        self.max_rx_packet_number = Some(self.max_rx_packet_number.map_or(pn, |x| x.max(pn)));
        Some(pn)
    }

    fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool, now: Instant) {
        self.received.insert(pn);
        while self.received.len() > MAX_ACK_RANGES {
            self.received.pop_min();
        }
        if ack_eliciting && self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }
    }

    fn on_handshake_data(&mut self, stream: Stream) -> Result<(), Error> {
        let end = self.handshake_rx.end();
        if stream.offset > end {
            debug!(offset = stream.offset, expected = end, "dropping out-of-order handshake data");
            return Ok(());
        }
        let skip = end - stream.offset;
        if skip >= stream.data.len() as u64 {
            return Ok(());
        }
        self.handshake_rx.append(&stream.data[skip as usize..])
    }

    fn on_ack(&mut self, mut ack: Ack) -> Result<(), Error> {
        let Some(largest_sent) = self.largest_sent else {
            warn!("peer acknowledged a packet before any was sent");
            return Err(Error::Proto);
        };
        packet_number::adjust_ack_ranges(&mut ack, largest_sent);
        if ack.largest > largest_sent {
            warn!(largest = ack.largest, largest_sent, "peer acknowledged unsent packet");
            return Err(Error::Proto);
        }
        if ack.smallest().is_none() {
            return Err(Error::InvalidArgument);
        }
        trace!(ranges = ?ack.iter().collect::<Vec<_>>(), delay = ack.delay, "got ack");
        self.largest_acked = Some(self.largest_acked.map_or(ack.largest, |x| x.max(ack.largest)));
        Ok(())
    }

    fn on_connection_close(&mut self, reason: ConnectionClose) {
        debug!(%reason, "peer closed the connection");
        self.state.move_to_draining(reason.clone());
        self.events.push_back(Event::ConnectionClosed(reason));
    }

    /// Hand newly arrived handshake bytes to TLS and collect its response
    fn drive_handshake(&mut self) -> Result<(), Error> {
        if !self.handshake_rx.is_empty() {
            let data = self.handshake_rx.drain(usize::MAX);
            self.session.consume_handshake_bytes(&data)?;
            self.pull_handshake()?;
        }
        if self.state.is_handshaking() && !self.session.is_handshaking() {
            self.complete_handshake()?;
        }
        Ok(())
    }

    fn pull_handshake(&mut self) -> Result<(), Error> {
        let bytes = self.session.produce_handshake_bytes()?;
        if !bytes.is_empty() {
            trace!(len = bytes.len(), "queued handshake data");
            self.handshake_tx.append(&bytes)?;
        }
        Ok(())
    }

    fn complete_handshake(&mut self) -> Result<(), Error> {
        let (ctx, keys) = crypto::setup_crypto_context(&mut *self.session, self.side)?;
        self.tx_key = Some(keys.tx);
        self.rx_key = Some(keys.rx);
        debug!(hash = ?ctx.hash, aead = ?ctx.aead, "handshake complete");
        self.crypto = Some(ctx);
        self.state.move_to_handshake_complete();
        self.events.push_back(Event::HandshakeCompleted);
        Ok(())
    }

    fn write_packet(&mut self, now: Instant) -> Result<Option<Bytes>, Error> {
        if !self.handshake_tx.is_empty() {
            return self.write_cleartext(now).map(Some);
        }
        if self.crypto.is_some() {
            if self.ack_pending_since.is_some()
                || self.pending_close.is_some()
                || !self.pending_frames.is_empty()
            {
                return self.write_protected(now);
            }
            return Ok(None);
        }
        if self.ack_pending_since.is_some() {
            return self.write_cleartext(now).map(Some);
        }
        Ok(None)
    }

    /// Build a long header packet carrying an ACK and/or handshake data
    fn write_cleartext(&mut self, now: Instant) -> Result<Bytes, Error> {
        let ty = match self.side {
            Side::Client if !self.initial_sent => LongType::ClientInitial,
            Side::Client => LongType::ClientCleartext,
            Side::Server => LongType::ServerCleartext,
        };
        let pn = self.next_packet_number;
        let header = Header::Long {
            ty,
            conn_id: self.conn_id,
            number: pn as u32,
            version: self.config.version,
        };
        let size = usize::from(self.config.max_packet_size);
        let end = size - PACKET_HASH_LEN;
        let mut packet = vec![0; size];
        let mut len = header.encode(&mut packet)?;

        len += self.write_ack(&mut packet[len..end], now)?;
        if !self.handshake_tx.is_empty() {
            let offset = self.handshake_tx.offset();
            let overhead = Frame::Stream(Stream {
                id: HANDSHAKE_STREAM,
                offset,
                fin: false,
                data: Bytes::new(),
            })
            .encoded_len()?;
            let room = (end - len).saturating_sub(overhead);
            if room > 0 {
                let frame = Frame::Stream(Stream {
                    id: HANDSHAKE_STREAM,
                    offset,
                    fin: false,
                    data: self.handshake_tx.drain(room),
                });
                len += frame.encode(&mut packet[len..end])?;
            }
        }
        if ty == LongType::ClientInitial {
            // Remaining bytes are already zero, which is PADDING
            len = len.max(usize::from(self.config.min_initial_size).saturating_sub(PACKET_HASH_LEN));
            self.initial_sent = true;
        }
        packet.truncate(len);
        append_packet_hash(&mut packet);
        self.on_packet_sent(pn);
        trace!(pn, len = packet.len(), ?ty, "sending cleartext packet");
        Ok(packet.into())
    }

    /// Build a short header packet protected with the 1-RTT keys
    fn write_protected(&mut self, now: Instant) -> Result<Option<Bytes>, Error> {
        let pn = self.next_packet_number;
        let number = match self.largest_acked {
            Some(largest_acked) => PacketNumber::new(pn, largest_acked),
            None => PacketNumber::U32(pn as u32),
        };
        let header = Header::Short {
            conn_id: Some(self.conn_id),
            number,
            key_phase: false,
        };
        let (Some(tx), Some(crypto)) = (self.tx_key.as_ref(), self.crypto.as_ref()) else {
            return Err(Error::Internal);
        };
        let (nonce, aead, overhead) = (tx.nonce(pn), crypto.aead, crypto.overhead);

        let size = usize::from(self.config.max_packet_size);
        let end = size.checked_sub(overhead).ok_or(Error::Internal)?;
        let mut packet = vec![0; size];
        let header_len = header.encode(&mut packet)?;
        let mut len = header_len;

        if let Some(close) = self.pending_close.take() {
            len += Frame::ConnectionClose(close).encode(&mut packet[len..end])?;
        }
        len += self.write_ack(&mut packet[len..end], now)?;
        while let Some(frame) = self.pending_frames.pop_front() {
            let room = end - len;
            let frame_len = frame.encoded_len()?;
            if frame_len <= room {
                len += frame.encode(&mut packet[len..end])?;
                continue;
            }
            match frame {
                Frame::Stream(stream) => {
                    let (head, rest) = split_stream(stream, room)?;
                    if let Some(head) = head {
                        len += Frame::Stream(head).encode(&mut packet[len..end])?;
                    }
                    self.pending_frames.push_front(Frame::Stream(rest));
                }
                frame => self.pending_frames.push_front(frame),
            }
            break;
        }
        if len == header_len {
            return Ok(None);
        }

        packet.truncate(len);
        let mut payload = packet.split_off(header_len);
        let tx_key = self.tx_key.as_ref().ok_or(Error::Internal)?;
        self.session
            .encrypt(aead, tx_key.key(), &nonce, &packet, &mut payload)?;
        packet.extend_from_slice(&payload);
        self.on_packet_sent(pn);
        trace!(pn, len = packet.len(), "sending protected packet");
        Ok(Some(packet.into()))
    }

    fn on_packet_sent(&mut self, pn: u64) {
        self.largest_sent = Some(pn);
        self.next_packet_number += 1;
    }

    /// Write a pending ACK into `buf` if it fits, returning the bytes written
    fn write_ack(&mut self, buf: &mut [u8], now: Instant) -> Result<usize, Error> {
        let Some(since) = self.ack_pending_since else {
            return Ok(0);
        };
        let delay = now.saturating_duration_since(since).as_micros();
        let delay = u16::try_from(delay).unwrap_or(u16::MAX);
        let Some(ack) = self.received.to_ack(delay, MAX_ACK_RANGES) else {
            return Ok(0);
        };
        match Frame::Ack(ack).encode(buf) {
            Ok(n) => {
                self.ack_pending_since = None;
                Ok(n)
            }
            Err(Error::NoBuffer) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Room for frames in a protected packet that carries nothing else
    fn max_protected_payload(&self) -> usize {
        let overhead = self.crypto.as_ref().map_or(0, |c| c.overhead);
        usize::from(self.config.max_packet_size)
            .saturating_sub(crate::packet::MAX_SHORT_HEADER_LEN + overhead)
    }
}

/// Split `stream` so that its first part occupies at most `room` bytes
///
/// The first part is `None` when not even an empty frame fits.
fn split_stream(mut stream: Stream, room: usize) -> Result<(Option<Stream>, Stream), Error> {
    let overhead = Frame::Stream(Stream {
        data: Bytes::new(),
        ..stream.clone()
    })
    .encoded_len()?;
    if room <= overhead {
        return Ok((None, stream));
    }
    let data = stream.data.split_to(room - overhead);
    let head = Stream {
        id: stream.id,
        offset: stream.offset,
        fin: false,
        data,
    };
    stream.offset += head.data.len() as u64;
    Ok((Some(head), stream))
}

/// Events of interest to the application
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    /// 1-RTT keys are installed and application data may flow
    HandshakeCompleted,
    /// The server offered these versions instead of ours
    VersionNegotiation(Vec<u32>),
    /// A frame whose handling is left to the application
    Frame(Frame),
    /// The peer closed the connection
    ConnectionClosed(ConnectionClose),
}
