use std::time::Instant;

use assert_matches::assert_matches;
use bytes::Bytes;

use crate::{
    frame::{self, Frame},
    packet::{
        append_packet_hash, verify_packet_hash, ConnectionId, Header, LongType, PacketNumber,
        LONG_HEADER_LEN,
    },
    Connection, ConnectionClose, ConnectionConfig, Error, Event, Side, StateType, StreamId,
    VERSION,
};

use util::*;

fn client() -> Connection {
    Connection::client(
        ConnectionConfig::default(),
        Box::new(MockSession::new(Side::Client)),
        [0; 32],
    )
    .unwrap()
}

fn server() -> Connection {
    Connection::server(
        ConnectionConfig::default(),
        Box::new(MockSession::new(Side::Server)),
        [1; 32],
    )
    .unwrap()
}

/// A hash-protected long header packet carrying `frames`
fn cleartext(ty: LongType, conn_id: ConnectionId, number: u32, frames: &[Frame]) -> Vec<u8> {
    let mut packet = vec![0; 1200];
    let header = Header::Long {
        ty,
        conn_id,
        number,
        version: VERSION,
    };
    let mut len = header.encode(&mut packet).unwrap();
    for frame in frames {
        len += frame.encode(&mut packet[len..]).unwrap();
    }
    packet.truncate(len);
    append_packet_hash(&mut packet);
    packet
}

fn handshake_data(offset: u64, data: &[u8]) -> Frame {
    Frame::Stream(frame::Stream {
        id: StreamId(0),
        offset,
        fin: false,
        data: Bytes::copy_from_slice(data),
    })
}

/// A server that has accepted `client`'s Client Initial, and the next packet number it expects
fn accepted(client: &mut Connection, mut server: Connection) -> (Connection, u32) {
    let packet = client.produce_send_packet(Instant::now()).unwrap().unwrap();
    server.on_bytes_received(&packet, Instant::now()).unwrap();
    assert_eq!(server.state(), StateType::Handshaking);
    let next = server.max_rx_packet_number().unwrap() as u32 + 1;
    (server, next)
}

/// Stream frames delivered to the application, in order
fn stream_frames(conn: &mut Connection) -> Vec<frame::Stream> {
    let mut out = Vec::new();
    while let Some(event) = conn.poll() {
        match event {
            Event::Frame(Frame::Stream(s)) => out.push(s),
            e => panic!("unexpected event {e:?}"),
        }
    }
    out
}

#[test]
fn handshake() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    assert_eq!(pair.client.state(), StateType::Handshaking);
    assert_eq!(pair.server.state(), StateType::Idle);
    pair.connect();

    for conn in [&pair.client, &pair.server] {
        assert_eq!(conn.state(), StateType::HandshakeComplete);
        assert!(conn.is_handshake_complete());
        assert!(conn.has_1rtt());
    }
    assert_eq!(pair.client.connection_id(), pair.server.connection_id());
    let client_ctx = pair.client.crypto_context().unwrap();
    let server_ctx = pair.server.crypto_context().unwrap();
    assert_eq!(client_ctx.tx_secret, server_ctx.rx_secret);
    assert_eq!(client_ctx.rx_secret, server_ctx.tx_secret);
}

#[test]
fn client_initial_is_padded() {
    let _guard = subscribe();
    let mut client = client();
    let packet = client.produce_send_packet(Instant::now()).unwrap().unwrap();
    assert_eq!(packet.len(), 1200);
    let (header, _) = Header::decode(&packet).unwrap();
    assert_matches!(
        header,
        Header::Long {
            ty: LongType::ClientInitial,
            version: VERSION,
            ..
        }
    );
    assert_eq!(header.conn_id(), Some(client.connection_id()));

    let body = verify_packet_hash(&packet).unwrap();
    let frames = frame::Iter::new(Bytes::copy_from_slice(&body[LONG_HEADER_LEN..]))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_matches!(
        &frames[..],
        [Frame::Stream(s), Frame::Padding { .. }] if s.id == StreamId(0) && s.offset == 0
    );

    // Nothing further until the server answers
    assert_eq!(client.produce_send_packet(Instant::now()), Ok(None));
}

#[test]
fn server_hello_spans_packets() {
    let _guard = subscribe();
    let mut server_session = MockSession::new(Side::Server);
    server_session.server_hello_len = 5000;
    let mut pair = Pair::new(MockSession::new(Side::Client), server_session);
    pair.step();
    let mut flight = Vec::new();
    while let Some(packet) = pair.server.produce_send_packet(pair.time).unwrap() {
        assert!(packet.len() <= 1232);
        flight.push(packet);
    }
    assert!(flight.len() > 3);
    for packet in &flight {
        assert_matches!(
            Header::decode(packet),
            Ok((
                Header::Long {
                    ty: LongType::ServerCleartext,
                    ..
                },
                _
            ))
        );
    }
    pair.to_client.extend(flight);
    pair.connect();
}

#[test]
fn stream_data() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    pair.client
        .send_stream(StreamId(4), Bytes::from_static(b"hello"), false)
        .unwrap();
    pair.client
        .send_stream(StreamId(4), Bytes::from_static(b" world"), true)
        .unwrap();
    pair.drive();

    let frames = stream_frames(&mut pair.server);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].id, StreamId(4));
    assert_eq!(frames[0].offset, 0);
    assert_eq!(&frames[0].data[..], b"hello");
    assert!(!frames[0].fin);
    assert_eq!(frames[1].offset, 5);
    assert_eq!(&frames[1].data[..], b" world");
    assert!(frames[1].fin);

    pair.server
        .send_stream(StreamId(1), Bytes::from_static(b"reply"), true)
        .unwrap();
    pair.drive();
    let frames = stream_frames(&mut pair.client);
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].data[..], b"reply");
}

#[test]
fn large_stream_write_is_split() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let data = (0..5000u32).map(|i| i as u8).collect::<Vec<_>>();
    pair.client
        .send_stream(StreamId(8), data.clone().into(), true)
        .unwrap();
    pair.drive();

    let frames = stream_frames(&mut pair.server);
    assert!(frames.len() > 1);
    let mut received = Vec::new();
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.offset, received.len() as u64);
        assert_eq!(frame.fin, i == frames.len() - 1);
        received.extend_from_slice(&frame.data);
    }
    assert_eq!(received, data);
}

#[test]
fn packet_numbers_shrink_once_acked() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    pair.client
        .send_stream(StreamId(4), Bytes::from_static(b"ping"), false)
        .unwrap();
    let packet = pair
        .client
        .produce_send_packet(pair.time)
        .unwrap()
        .unwrap();
    let (header, _) = Header::decode(&packet).unwrap();
    assert_matches!(
        header,
        Header::Short {
            number: PacketNumber::U8(_),
            conn_id: Some(_),
            key_phase: false,
        }
    );
    pair.to_server.push_back(packet);
    pair.drive();
    assert_eq!(stream_frames(&mut pair.server).len(), 1);
}

#[test]
fn control_frames_reach_application() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    pair.server.send_frame(Frame::MaxData(1 << 20)).unwrap();
    pair.server
        .send_frame(Frame::StreamBlocked(StreamId(4)))
        .unwrap();
    pair.drive();
    assert_eq!(pair.client.poll(), Some(Event::Frame(Frame::MaxData(1 << 20))));
    assert_eq!(
        pair.client.poll(),
        Some(Event::Frame(Frame::StreamBlocked(StreamId(4))))
    );
    assert_eq!(pair.client.poll(), None);
}

#[test]
fn send_frame_rejects_engine_frames() {
    let mut pair = Pair::default();
    assert_eq!(pair.client.send_frame(Frame::Ping), Err(Error::InvalidState));
    pair.connect();
    assert_eq!(
        pair.client.send_frame(Frame::Padding { len: 10 }),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        pair.client.send_frame(Frame::ConnectionClose(ConnectionClose {
            error_code: 0,
            reason: Bytes::new(),
        })),
        Err(Error::InvalidArgument)
    );
    assert_eq!(pair.client.send_frame(Frame::Ping), Ok(()));
}

#[test]
fn stream_data_requires_handshake() {
    let mut client = client();
    assert_eq!(
        client.send_stream(StreamId(4), Bytes::from_static(b"early"), false),
        Err(Error::InvalidState)
    );
    assert_eq!(client.state(), StateType::Handshaking);
}

#[test]
fn handshake_stream_is_reserved() {
    let mut pair = Pair::default();
    pair.connect();
    assert_eq!(
        pair.client
            .send_stream(StreamId(0), Bytes::from_static(b"x"), false),
        Err(Error::InvalidArgument)
    );
}

#[test]
fn close() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    pair.client
        .send_stream(StreamId(4), Bytes::from_static(b"discarded"), false)
        .unwrap();
    pair.client
        .close(42, Bytes::from_static(b"goodbye"))
        .unwrap();
    assert_eq!(pair.client.state(), StateType::Closing);
    assert_eq!(
        pair.client
            .send_stream(StreamId(4), Bytes::from_static(b"late"), false),
        Err(Error::InvalidState)
    );
    pair.drive();

    assert_eq!(pair.server.state(), StateType::Draining);
    assert_eq!(
        pair.server.poll(),
        Some(Event::ConnectionClosed(ConnectionClose {
            error_code: 42,
            reason: Bytes::from_static(b"goodbye"),
        }))
    );
    assert_eq!(pair.server.poll(), None);

    // A draining connection neither reads nor writes
    assert_eq!(pair.server.on_bytes_received(&[0x43; 40], pair.time), Ok(()));
    assert_eq!(pair.server.produce_send_packet(pair.time), Ok(None));
}

#[test]
fn corrupted_hash_is_fatal() {
    let _guard = subscribe();
    let mut client = client();
    let mut server = server();
    let packet = client.produce_send_packet(Instant::now()).unwrap().unwrap();
    let mut corrupted = packet.to_vec();
    corrupted[LONG_HEADER_LEN + 30] ^= 0xff;

    assert_eq!(
        server.on_bytes_received(&corrupted, Instant::now()),
        Err(Error::BadPacketHash)
    );
    assert_eq!(server.state(), StateType::Failed);
    assert_eq!(
        server.on_bytes_received(&packet, Instant::now()),
        Err(Error::InvalidState)
    );
    assert_eq!(
        server.produce_send_packet(Instant::now()),
        Err(Error::InvalidState)
    );
}

#[test]
fn protected_packet_tampering_is_fatal() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.client
        .send_stream(StreamId(4), Bytes::from_static(b"secret"), false)
        .unwrap();
    let mut packet = pair
        .client
        .produce_send_packet(pair.time)
        .unwrap()
        .unwrap()
        .to_vec();
    let last = packet.len() - 1;
    packet[last] ^= 0x01;
    assert_eq!(
        pair.server.on_bytes_received(&packet, pair.time),
        Err(Error::CallbackFailure)
    );
    assert_eq!(pair.server.state(), StateType::Failed);
}

#[test]
fn receive_key_failure_leaves_no_keys() {
    let _guard = subscribe();
    let mut server_session = MockSession::new(Side::Server);
    server_session.fail_export = Some(Side::Client);
    let mut pair = Pair::new(MockSession::new(Side::Client), server_session);
    let err = loop {
        match pair.try_step() {
            Ok(true) => {}
            Ok(false) => panic!("handshake finished without error"),
            Err(e) => break e,
        }
    };
    assert_eq!(err, Error::CallbackFailure);
    assert_eq!(pair.server.state(), StateType::Failed);
    assert!(!pair.server.has_1rtt());
    assert!(!pair.server.is_handshake_complete());
    assert!(pair.server.crypto_context().is_none());
}

#[test]
fn tls_failure_is_fatal() {
    let _guard = subscribe();
    let mut server_session = MockSession::new(Side::Server);
    server_session.fail_consume = true;
    let mut pair = Pair::new(MockSession::new(Side::Client), server_session);
    assert_eq!(pair.try_step(), Err(Error::CallbackFailure));
    assert_eq!(pair.server.state(), StateType::Failed);
}

#[test]
fn protected_packet_before_keys() {
    let _guard = subscribe();
    let mut server = server();
    let header = Header::Short {
        conn_id: Some(server.connection_id()),
        number: PacketNumber::U8(1),
        key_phase: false,
    };
    let mut packet = vec![0; 40];
    header.encode(&mut packet).unwrap();
    assert_eq!(
        server.on_bytes_received(&packet, Instant::now()),
        Err(Error::InvalidState)
    );
    assert_eq!(server.state(), StateType::Idle);
}

#[test]
fn client_rejects_client_initial() {
    let _guard = subscribe();
    let mut client = client();
    let mut other = Connection::client(
        ConnectionConfig::default(),
        Box::new(MockSession::new(Side::Client)),
        [2; 32],
    )
    .unwrap();
    let packet = other.produce_send_packet(Instant::now()).unwrap().unwrap();
    assert_eq!(
        client.on_bytes_received(&packet, Instant::now()),
        Err(Error::Proto)
    );
    assert_eq!(client.state(), StateType::Failed);
}

#[test]
fn idle_server_requires_client_initial() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.step();
    pair.step();
    // The client now answers with its finished message in a Client Cleartext packet
    let packet = pair
        .client
        .produce_send_packet(pair.time)
        .unwrap()
        .unwrap();
    assert_matches!(
        Header::decode(&packet),
        Ok((
            Header::Long {
                ty: LongType::ClientCleartext,
                ..
            },
            _
        ))
    );
    let mut fresh = server();
    assert_eq!(
        fresh.on_bytes_received(&packet, pair.time),
        Err(Error::Proto)
    );
}

#[test]
fn duplicate_packets_are_dropped() {
    let _guard = subscribe();
    let mut client = client();
    let mut server = server();
    let packet = client.produce_send_packet(Instant::now()).unwrap().unwrap();
    server.on_bytes_received(&packet, Instant::now()).unwrap();
    let max = server.max_rx_packet_number();
    assert!(max.is_some());
    let mut flight = 0;
    while server.produce_send_packet(Instant::now()).unwrap().is_some() {
        flight += 1;
    }

    assert_eq!(server.on_bytes_received(&packet, Instant::now()), Ok(()));
    assert_eq!(server.max_rx_packet_number(), max);
    assert_eq!(server.produce_send_packet(Instant::now()), Ok(None));
    assert!(flight > 0);
}

#[test]
fn unsupported_version_is_ignored() {
    let mut config = ConnectionConfig::default();
    config.version(0xff00_0004);
    let mut client = Connection::client(
        config,
        Box::new(MockSession::new(Side::Client)),
        [0; 32],
    )
    .unwrap();
    let mut server = server();
    let packet = client.produce_send_packet(Instant::now()).unwrap().unwrap();
    assert_eq!(server.on_bytes_received(&packet, Instant::now()), Ok(()));
    assert_eq!(server.state(), StateType::Idle);
    assert_eq!(server.max_rx_packet_number(), None);
}

#[test]
fn version_negotiation() {
    let _guard = subscribe();
    let mut client = client();
    let mut packet = vec![0x81];
    packet.extend_from_slice(&client.connection_id().value().to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes());
    packet.extend_from_slice(&0xff00_0007u32.to_be_bytes());
    packet.extend_from_slice(&0xff00_0006u32.to_be_bytes());

    client.on_bytes_received(&packet, Instant::now()).unwrap();
    assert_eq!(
        client.poll(),
        Some(Event::VersionNegotiation(vec![0xff00_0007, 0xff00_0006]))
    );

    // Negotiation for another connection is not ours to act on
    packet[1] ^= 0xff;
    client.on_bytes_received(&packet, Instant::now()).unwrap();
    assert_eq!(client.poll(), None);
}

#[test]
fn invalid_config() {
    let mut config = ConnectionConfig::default();
    config.max_packet_size(1000);
    let result = Connection::client(config, Box::new(MockSession::new(Side::Client)), [0; 32]);
    assert_eq!(result.err(), Some(Error::InvalidArgument));
}

#[test]
fn packet_numbers_cross_windows() {
    let _guard = subscribe();
    let mut config = ConnectionConfig::default();
    config.initial_packet_number_limit(1);
    let mut pair = Pair::with_config(
        config,
        MockSession::new(Side::Client),
        MockSession::new(Side::Server),
    );
    pair.connect();

    for i in 0..600u32 {
        pair.client.send_frame(Frame::Ping).unwrap();
        if i % 3 == 0 {
            pair.server.send_frame(Frame::Ping).unwrap();
        }
        if let Err(e) = pair.try_step() {
            panic!("step {i} failed with {e:?}");
        }
    }
    pair.drive();
    assert_eq!(pair.client.state(), StateType::HandshakeComplete);
    assert_eq!(pair.server.state(), StateType::HandshakeComplete);
    assert!(pair.server.max_rx_packet_number().unwrap() > 0x200);
    assert!(pair.client.max_rx_packet_number().unwrap() > 0x100);
}

#[test]
fn ack_before_sending_is_fatal() {
    let _guard = subscribe();
    let mut server = server();
    let ack = Frame::Ack(frame::Ack {
        largest: 5,
        delay: 0,
        first_block: 1,
        blocks: Vec::new(),
        timestamps: Vec::new(),
    });
    let packet = cleartext(LongType::ClientInitial, ConnectionId::new(0x1234), 7, &[ack]);
    assert_eq!(
        server.on_bytes_received(&packet, Instant::now()),
        Err(Error::Proto)
    );
    assert_eq!(server.state(), StateType::Failed);
}

#[test]
fn cleartext_rejects_application_stream() {
    let _guard = subscribe();
    let mut client = client();
    let (mut server, pn) = accepted(&mut client, server());
    let stream = Frame::Stream(frame::Stream {
        id: StreamId(4),
        offset: 0,
        fin: false,
        data: Bytes::from_static(b"too early"),
    });
    let packet = cleartext(
        LongType::ClientCleartext,
        server.connection_id(),
        pn,
        &[stream],
    );
    assert_eq!(
        server.on_bytes_received(&packet, Instant::now()),
        Err(Error::Proto)
    );
    assert_eq!(server.state(), StateType::Failed);
}

#[test]
fn handshake_data_is_trimmed_and_gaps_dropped() {
    let _guard = subscribe();
    let mut client = client();
    let (mut server, pn) = accepted(&mut client, server());
    let cid = server.connection_id();

    // The Client Hello occupies offsets 0..35; the finished message follows it
    let mut finished = vec![20, 0, 32];
    finished.extend(0..32u8);

    let stale = [handshake_data(0, &[0x99; 10]), handshake_data(100, &finished)];
    let packet = cleartext(LongType::ClientCleartext, cid, pn, &stale);
    assert_eq!(server.on_bytes_received(&packet, Instant::now()), Ok(()));
    assert_eq!(server.state(), StateType::Handshaking);
    assert_eq!(server.poll(), None);

    // Bytes already delivered are skipped rather than handed to TLS again
    let mut overlapping = vec![0x99; 35];
    overlapping.extend_from_slice(&finished);
    let packet = cleartext(
        LongType::ClientCleartext,
        cid,
        pn + 1,
        &[handshake_data(0, &overlapping)],
    );
    assert_eq!(server.on_bytes_received(&packet, Instant::now()), Ok(()));
    assert_eq!(server.state(), StateType::HandshakeComplete);
    assert_eq!(server.poll(), Some(Event::HandshakeCompleted));
}

#[test]
fn handshake_buffer_limit() {
    let _guard = subscribe();
    let mut config = ConnectionConfig::default();
    config.crypto_buffer_size(64);

    // An outgoing server hello larger than the limit
    let mut server = Connection::server(
        config.clone(),
        Box::new(MockSession::new(Side::Server)),
        [1; 32],
    )
    .unwrap();
    let packet = client().produce_send_packet(Instant::now()).unwrap().unwrap();
    assert_eq!(
        server.on_bytes_received(&packet, Instant::now()),
        Err(Error::Proto)
    );
    assert_eq!(server.state(), StateType::Failed);

    // Incoming handshake data larger than the limit
    let mut session = MockSession::new(Side::Server);
    session.server_hello_len = 10;
    let server = Connection::server(config, Box::new(session), [1; 32]).unwrap();
    let mut client = client();
    let (mut server, pn) = accepted(&mut client, server);
    let packet = cleartext(
        LongType::ClientCleartext,
        server.connection_id(),
        pn,
        &[handshake_data(35, &[0; 100])],
    );
    assert_eq!(
        server.on_bytes_received(&packet, Instant::now()),
        Err(Error::Proto)
    );
    assert_eq!(server.state(), StateType::Failed);
}

#[test]
fn unsupported_packet_types_are_dropped() {
    let _guard = subscribe();
    let mut client = client();
    let (mut server, pn) = accepted(&mut client, server());
    let max = server.max_rx_packet_number();
    for ty in [LongType::ZeroRttProtected, LongType::PublicReset] {
        let packet = cleartext(ty, server.connection_id(), pn, &[Frame::Ping]);
        assert_eq!(server.on_bytes_received(&packet, Instant::now()), Ok(()));
    }
    assert_eq!(server.state(), StateType::Handshaking);
    assert_eq!(server.max_rx_packet_number(), max);
    assert_eq!(server.poll(), None);
}
