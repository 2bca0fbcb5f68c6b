use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use ring::{digest, hmac};
use slog::{Drain, Logger};

use coding::{BufExt, BufMutExt, Codec};
use connection::{ConnectionHandle, State};
use crypto::{KeyPair, PeerIdentity, Pki, SecurityPolicy};
use endpoint::{
    ChannelConfig, Config, Endpoint, EndpointConfig, Event, Io, ListenerHandle,
    ReverseClientConfig, SocketId, Timer,
};
use message::{ChunkEnd, ErrorMessage, MessageType, TcpHeader};
use {SecurityMode, SecurityModeMask, Side, StatusCode};

const SERVER_URL: &str = "opc.tcp://server.example:4840/test";
const CLIENT_URL: &str = "opc.tcp://client.example:4840/reverse";
const CLIENT_CERT: &[u8] = b"test client certificate der";
const SERVER_CERT: &[u8] = b"test server certificate der";

fn logger() -> Logger {
    let decorator = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, o!())
}

// ---- crypto provider doubles -----------------------------------------
//
// The pair below mimics an RSA provider with a reversible keystream
// construction keyed on the certificate bytes, so both ends of a test can
// agree without a real PKI.

const ASYM_CIPHER_BLOCK: usize = 128;
const ASYM_PLAIN_BLOCK: usize = 112;
const ASYM_SIGNATURE: usize = 32;

fn keystream(cert: &[u8], block: usize) -> Vec<u8> {
    let mut seed = cert.to_vec();
    seed.push(block as u8);
    let mut out = Vec::with_capacity(ASYM_CIPHER_BLOCK);
    let mut counter = 0u8;
    while out.len() < ASYM_CIPHER_BLOCK {
        let mut input = seed.clone();
        input.push(counter);
        out.extend_from_slice(digest::digest(&digest::SHA256, &input).as_ref());
        counter += 1;
    }
    out.truncate(ASYM_CIPHER_BLOCK);
    out
}

fn test_sign(cert: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::SigningKey::new(&digest::SHA256, cert);
    hmac::sign(&key, data).as_ref().to_vec()
}

struct TestKeyPair {
    cert: Vec<u8>,
}

impl KeyPair for TestKeyPair {
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, StatusCode> {
        if cipher.len() % ASYM_CIPHER_BLOCK != 0 {
            return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
        }
        let mut plain = Vec::with_capacity(cipher.len() / ASYM_CIPHER_BLOCK * ASYM_PLAIN_BLOCK);
        for (i, block) in cipher.chunks(ASYM_CIPHER_BLOCK).enumerate() {
            let ks = keystream(&self.cert, i);
            plain.extend(
                block[..ASYM_PLAIN_BLOCK]
                    .iter()
                    .zip(&ks)
                    .map(|(&c, &k)| c ^ k),
            );
        }
        Ok(plain)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, StatusCode> {
        Ok(test_sign(&self.cert, data))
    }

    fn cipher_block_size(&self) -> usize {
        ASYM_CIPHER_BLOCK
    }

    fn plain_block_size(&self) -> usize {
        ASYM_PLAIN_BLOCK
    }

    fn signature_size(&self) -> usize {
        ASYM_SIGNATURE
    }
}

struct TestIdentity {
    cert: Vec<u8>,
}

impl PeerIdentity for TestIdentity {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, StatusCode> {
        if plain.len() % ASYM_PLAIN_BLOCK != 0 {
            return Err(StatusCode::BAD_ENCODING_ERROR);
        }
        let mut cipher = Vec::with_capacity(plain.len() / ASYM_PLAIN_BLOCK * ASYM_CIPHER_BLOCK);
        for (i, block) in plain.chunks(ASYM_PLAIN_BLOCK).enumerate() {
            let ks = keystream(&self.cert, i);
            cipher.extend(block.iter().zip(&ks).map(|(&p, &k)| p ^ k));
            cipher.extend_from_slice(&ks[ASYM_PLAIN_BLOCK..]);
        }
        Ok(cipher)
    }

    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), StatusCode> {
        if test_sign(&self.cert, data) == signature {
            Ok(())
        } else {
            Err(StatusCode::BAD_SECURITY_CHECKS_FAILED)
        }
    }

    fn cipher_block_size(&self) -> usize {
        ASYM_CIPHER_BLOCK
    }

    fn plain_block_size(&self) -> usize {
        ASYM_PLAIN_BLOCK
    }

    fn signature_size(&self) -> usize {
        ASYM_SIGNATURE
    }
}

struct TestPki;

impl Pki for TestPki {
    fn validate(&self, cert_der: &[u8], _policy: SecurityPolicy) -> Result<(), StatusCode> {
        if cert_der.starts_with(b"BAD") {
            Err(StatusCode::BAD_CERTIFICATE_INVALID)
        } else {
            Ok(())
        }
    }

    fn peer_identity(&self, cert_der: &[u8]) -> Result<Box<PeerIdentity>, StatusCode> {
        Ok(Box::new(TestIdentity {
            cert: cert_der.to_vec(),
        }))
    }
}

fn none_client_config() -> ChannelConfig {
    ChannelConfig {
        url: SERVER_URL.to_string(),
        policy: SecurityPolicy::None,
        mode: SecurityMode::None,
        requested_lifetime_ms: 60_000,
        max_message_size: 0,
        own_certificate: None,
        key_pair: None,
        peer_certificate: None,
        pki: None,
    }
}

fn secured_client_config() -> ChannelConfig {
    ChannelConfig {
        url: SERVER_URL.to_string(),
        policy: SecurityPolicy::Basic256Sha256,
        mode: SecurityMode::SignAndEncrypt,
        requested_lifetime_ms: 4_000,
        max_message_size: 0,
        own_certificate: Some(Bytes::from(CLIENT_CERT)),
        key_pair: Some(Arc::new(TestKeyPair {
            cert: CLIENT_CERT.to_vec(),
        })),
        peer_certificate: Some(Bytes::from(SERVER_CERT)),
        pki: Some(Arc::new(TestPki)),
    }
}

fn server_endpoint_config(policies: Vec<(SecurityPolicy, SecurityModeMask)>) -> EndpointConfig {
    EndpointConfig {
        url: SERVER_URL.to_string(),
        server_uri: "urn:test:server".to_string(),
        listens: true,
        policies,
        own_certificate: Some(Bytes::from(SERVER_CERT)),
        key_pair: Some(Arc::new(TestKeyPair {
            cert: SERVER_CERT.to_vec(),
        })),
        pki: Some(Arc::new(TestPki)),
        reverse_clients: Vec::new(),
    }
}

fn all_policies() -> Vec<(SecurityPolicy, SecurityModeMask)> {
    vec![
        (SecurityPolicy::None, SecurityModeMask::NONE),
        (
            SecurityPolicy::Basic256Sha256,
            SecurityModeMask::SIGN | SecurityModeMask::SIGN_AND_ENCRYPT,
        ),
    ]
}

// ---- in-memory socket fabric -----------------------------------------

struct Pair {
    client: Endpoint,
    server: Endpoint,
    time: u64,
    next_socket: usize,
    listeners: HashMap<String, (Side, ListenerHandle)>,
    /// `(owner, socket)` of one end to `(peer, peer socket, peer conn)`.
    routes: HashMap<(Side, usize), (Side, usize, ConnectionHandle)>,
    /// Accept-side socket to the initiating `(side, socket, connection)`.
    pending: HashMap<(Side, usize), (Side, usize, ConnectionHandle)>,
    timers: HashMap<(Side, Timer), u64>,
    /// Every transmitted frame, in order.
    wire: Vec<(Side, Vec<u8>)>,
}

impl Pair {
    fn new(client_config: Config, server_config: Config) -> Pair {
        let log = logger();
        Pair {
            client: Endpoint::new(log.new(o!("side" => "client")), client_config),
            server: Endpoint::new(log.new(o!("side" => "server")), server_config),
            time: 1_000,
            next_socket: 0,
            listeners: HashMap::new(),
            routes: HashMap::new(),
            pending: HashMap::new(),
            timers: HashMap::new(),
            wire: Vec::new(),
        }
    }

    fn default() -> Pair {
        Pair::new(Config::default(), Config::default())
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    fn alloc_socket(&mut self) -> usize {
        self.next_socket += 1;
        self.next_socket
    }

    fn drive(&mut self) {
        loop {
            let c = self.drive_side(Side::Client);
            let s = self.drive_side(Side::Server);
            if !c && !s {
                break;
            }
        }
    }

    fn drive_side(&mut self, side: Side) -> bool {
        let mut progress = false;
        loop {
            let op = match self.endpoint_mut(side).poll_io() {
                Some(op) => op,
                None => break,
            };
            progress = true;
            let time = self.time;
            match op {
                Io::Transmit { socket, data } => {
                    self.wire.push((side, data.to_vec()));
                    if let Some(&(peer, _, conn)) = self.routes.get(&(side, socket.0)) {
                        self.endpoint_mut(peer).handle(time, conn, &data);
                    }
                }
                Io::ConnectSocket { connection, url } => {
                    match self.listeners.get(&url).cloned() {
                        Some((owner, listener)) => {
                            let near = self.alloc_socket();
                            let far = self.alloc_socket();
                            self.pending.insert((owner, far), (side, near, connection));
                            self.endpoint_mut(owner).accepted(time, listener, SocketId(far));
                        }
                        None => {
                            self.endpoint_mut(side).socket_failure(time, connection);
                        }
                    }
                }
                Io::OpenListener { listener, url } => {
                    self.listeners.insert(url, (side, listener));
                    let socket = self.alloc_socket();
                    self.endpoint_mut(side).listener_opened(listener, SocketId(socket));
                }
                Io::Accept { socket, connection } => {
                    if let Some((init_side, init_socket, init_conn)) =
                        self.pending.remove(&(side, socket.0))
                    {
                        self.routes
                            .insert((side, socket.0), (init_side, init_socket, init_conn));
                        self.routes
                            .insert((init_side, init_socket), (side, socket.0, connection));
                        self.endpoint_mut(init_side).socket_connected(
                            time,
                            init_conn,
                            SocketId(init_socket),
                        );
                    }
                }
                Io::CloseSocket { socket } => {
                    if let Some((init_side, _, init_conn)) = self.pending.remove(&(side, socket.0))
                    {
                        self.endpoint_mut(init_side).socket_failure(time, init_conn);
                    }
                    if let Some((peer, peer_socket, peer_conn)) =
                        self.routes.remove(&(side, socket.0))
                    {
                        self.routes.remove(&(peer, peer_socket));
                        self.endpoint_mut(peer).socket_failure(time, peer_conn);
                    }
                }
                Io::CloseListener { .. } => {}
                Io::TimerStart { timer, time } => {
                    self.timers.insert((side, timer), time);
                }
                Io::TimerStop { timer } => {
                    self.timers.remove(&(side, timer));
                }
            }
        }
        progress
    }

    /// Fire the earliest armed timer matching `pred`, advancing time.
    fn fire<F: Fn(&Timer) -> bool>(&mut self, side: Side, pred: F) -> bool {
        let found = self
            .timers
            .iter()
            .filter(|&(&(s, ref timer), _)| s == side && pred(timer))
            .map(|(&(_, timer), &at)| (timer, at))
            .min_by_key(|&(_, at)| at);
        let (timer, at) = match found {
            Some(x) => x,
            None => return false,
        };
        self.timers.remove(&(side, timer));
        if at > self.time {
            self.time = at;
        }
        let time = self.time;
        self.endpoint_mut(side).timeout(time, timer);
        self.drive();
        true
    }

    fn events(&mut self, side: Side) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.endpoint_mut(side).poll() {
            events.push(event);
        }
        events
    }

    /// Establish a channel and return the two connection handles.
    fn connect(&mut self, config: ChannelConfig) -> (ConnectionHandle, ConnectionHandle) {
        let time = self.time;
        let client_conn = self.client.connect(time, config).unwrap();
        self.drive();
        let client_events = self.events(Side::Client);
        let server_events = self.events(Side::Server);
        assert_matches!(
            client_events.last(),
            Some(&Event::Connected { connection }) if connection == client_conn
        );
        let server_conn = match server_events.last() {
            Some(&Event::EndpointConnected { connection, .. }) => connection,
            other => panic!("server not connected: {:?}", other),
        };
        (client_conn, server_conn)
    }

    fn wire_frames(&self, side: Side, msg_type: MessageType) -> Vec<Vec<u8>> {
        self.wire
            .iter()
            .filter(|&&(s, ref data)| {
                s == side && data.len() >= 3 && &data[..3] == msg_type.as_bytes()
            })
            .map(|&(_, ref data)| data.clone())
            .collect()
    }
}

fn open_server(pair: &mut Pair, config: EndpointConfig) -> ListenerHandle {
    let time = pair.time;
    let listener = pair.server.open_endpoint(time, config).unwrap();
    pair.drive();
    listener
}

fn decode_error_frame(frame: &[u8]) -> ErrorMessage {
    let mut buf = Cursor::new(&frame[8..]);
    ErrorMessage::decode(&mut buf).unwrap()
}

// ---- scenarios -------------------------------------------------------

#[test]
fn none_mode_session_establishes() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());

    let client = pair.client.connection(client_conn).unwrap();
    let server = pair.server.connection(server_conn).unwrap();
    assert_eq!(client.state(), State::ScConnected);
    assert_eq!(server.state(), State::ScConnected);

    let client_token = client.current_token().unwrap();
    let server_token = server.current_token().unwrap();
    assert_ne!(client_token.secure_channel_id, 0);
    assert_ne!(client_token.token_id, 0);
    assert_eq!(client_token.secure_channel_id, server_token.secure_channel_id);
    assert_eq!(client_token.token_id, server_token.token_id);
    assert_eq!(client_token.revised_lifetime_ms, 60_000);

    // Both sides negotiated the default 64 KiB buffers
    assert_eq!(client.tcp.send_buffer_size, 65536);
    assert_eq!(client.tcp.receive_buffer_size, 65536);
    assert_eq!(server.tcp.send_buffer_size, 65536);
}

#[test]
fn message_round_trip() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());

    let body = Bytes::from(&b"read request"[..]);
    let time = pair.time;
    pair.client.send_message(time, client_conn, body.clone(), 7);
    pair.drive();

    let request_id = match pair.events(Side::Server).as_slice() {
        &[Event::ReceivedMessage {
            connection,
            request_id,
            body: ref received,
        }] => {
            assert_eq!(connection, server_conn);
            assert_eq!(&received[..], &body[..]);
            request_id
        }
        other => panic!("unexpected server events: {:?}", other),
    };

    let response = Bytes::from(&b"read response"[..]);
    let time = pair.time;
    pair.server
        .send_message(time, server_conn, response.clone(), request_id);
    pair.drive();
    match pair.events(Side::Client).as_slice() {
        &[Event::ReceivedMessage {
            connection,
            request_id,
            body: ref received,
        }] => {
            assert_eq!(connection, client_conn);
            // The client is handed back its own request handle
            assert_eq!(request_id, 7);
            assert_eq!(&received[..], &response[..]);
        }
        other => panic!("unexpected client events: {:?}", other),
    }
}

#[test]
fn sign_and_encrypt_session_with_renew() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(secured_client_config());

    let first_token = {
        let client = pair.client.connection(client_conn).unwrap();
        let token = client.current_token().unwrap().clone();
        assert_eq!(token.revised_lifetime_ms, 4_000);
        token
    };

    // A request left pending across the renewal, so the server still has
    // something to answer under the old token
    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&b"pre-renew request"[..]), 77);
    pair.drive();
    let pending_id = match pair.events(Side::Server).as_slice() {
        &[Event::ReceivedMessage { request_id, .. }] => request_id,
        other => panic!("unexpected server events: {:?}", other),
    };

    // The renew timer fires at 75 % of the token lifetime
    let renewed = pair.fire(Side::Client, |t| match *t {
        Timer::TokenRenew(_) => true,
        _ => false,
    });
    assert!(renewed);
    assert!(pair.time >= 1_000 + 3_000);

    {
        let client = pair.client.connection(client_conn).unwrap();
        assert_eq!(client.state(), State::ScConnected);
        let token = client.current_token().unwrap();
        assert_eq!(token.secure_channel_id, first_token.secure_channel_id);
        assert_ne!(token.token_id, first_token.token_id);
        assert_eq!(
            client.precedent_token.as_ref().unwrap().token_id,
            first_token.token_id
        );
    }
    assert!(!pair.server.connection(server_conn).unwrap().server_new_token_active);

    // Until the client talks under the new token, the server answers under
    // the precedent one and the client accepts it
    let time = pair.time;
    pair.server
        .send_message(time, server_conn, Bytes::from(&b"late response"[..]), pending_id);
    pair.drive();
    assert_matches!(
        pair.events(Side::Client).as_slice(),
        &[Event::ReceivedMessage { request_id, .. }] if request_id == 77
    );

    // A client message under the new token activates it server-side
    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&b"request"[..]), 1);
    pair.drive();
    assert_matches!(
        pair.events(Side::Server).as_slice(),
        &[Event::ReceivedMessage { .. }]
    );
    assert!(pair.server.connection(server_conn).unwrap().server_new_token_active);
}

#[test]
fn multi_chunk_message_reassembles() {
    let mut config = Config::default();
    config.receive_buffer_size = 8192;
    config.send_buffer_size = 8192;
    let mut pair = Pair::new(
        {
            let mut c = Config::default();
            c.receive_buffer_size = 8192;
            c.send_buffer_size = 8192;
            c
        },
        config,
    );
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());
    pair.wire.clear();

    let body: Vec<u8> = (0..3 * 8192).map(|i| i as u8).collect();
    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&body[..]), 11);
    pair.drive();

    // Reassembled exactly once on the server
    match pair.events(Side::Server).as_slice() {
        &[Event::ReceivedMessage {
            connection,
            body: ref received,
            ..
        }] => {
            assert_eq!(connection, server_conn);
            assert_eq!(&received[..], &body[..]);
        }
        other => panic!("unexpected server events: {:?}", other),
    }

    // Several 'C' chunks then one 'F', same request id, sequence numbers
    // increasing by one
    let frames = pair.wire_frames(Side::Client, MessageType::Message);
    assert!(frames.len() >= 3, "got {} chunks", frames.len());
    let mut expected_sn = None;
    let mut request_id = None;
    for (i, frame) in frames.iter().enumerate() {
        let is_last = i + 1 == frames.len();
        assert_eq!(frame[3], if is_last { b'F' } else { b'C' });
        let mut buf = Cursor::new(&frame[16..24]);
        let sn = buf.get::<u32>().unwrap();
        let rid = buf.get::<u32>().unwrap();
        if let Some(prev) = expected_sn {
            assert_eq!(sn, prev + 1);
        }
        expected_sn = Some(sn);
        if let Some(first) = request_id {
            assert_eq!(rid, first);
        }
        request_id = Some(rid);
    }
}

#[test]
fn abort_during_send_keeps_channel_open() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());

    // Make the second chunk of the next message fail to encode
    pair.client
        .connection_mut(client_conn)
        .unwrap()
        .fail_chunk_encode = Some(1);

    let body: Vec<u8> = (0..100_000).map(|i| i as u8).collect();
    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&body[..]), 21);
    pair.drive();

    match pair.events(Side::Client).as_slice() {
        &[Event::SendFailure {
            connection,
            request_handle,
            status,
        }] => {
            assert_eq!(connection, client_conn);
            assert_eq!(request_handle, 21);
            assert_eq!(status, StatusCode::BAD_ENCODING_ERROR);
        }
        other => panic!("unexpected client events: {:?}", other),
    }
    // The server saw the abort, reported nothing, and kept the channel
    assert!(pair.events(Side::Server).is_empty());
    assert_eq!(
        pair.client.connection(client_conn).unwrap().state(),
        State::ScConnected
    );
    assert_eq!(
        pair.server.connection(server_conn).unwrap().state(),
        State::ScConnected
    );
    let frames = pair.wire_frames(Side::Client, MessageType::Message);
    assert_eq!(frames.last().unwrap()[3], b'A');

    // The channel is still usable afterwards
    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&b"retry"[..]), 22);
    pair.drive();
    assert_matches!(
        pair.events(Side::Server).as_slice(),
        &[Event::ReceivedMessage { .. }]
    );
}

#[test]
fn reverse_hello_establishes_channel() {
    let mut pair = Pair::default();

    // Client listens for the server's reverse connection
    let reverse_ep = pair
        .client
        .open_reverse_endpoint(CLIENT_URL.to_string())
        .unwrap();
    pair.drive();
    let mut config = none_client_config();
    config.url = SERVER_URL.to_string();
    pair.client.reverse_connect(reverse_ep, config).unwrap();

    // Server endpoint with no listening socket, one reverse client
    let mut ep = server_endpoint_config(all_policies());
    ep.listens = false;
    ep.reverse_clients.push(ReverseClientConfig {
        url: CLIENT_URL.to_string(),
        retry_delay_ms: None,
    });
    open_server(&mut pair, ep);

    let client_events = pair.events(Side::Client);
    let client_conn = match client_events.as_slice() {
        &[Event::ReverseConnected {
            connection,
            listener,
        }] => {
            assert_eq!(listener, reverse_ep);
            connection
        }
        other => panic!("unexpected client events: {:?}", other),
    };
    assert_matches!(
        pair.events(Side::Server).as_slice(),
        &[Event::EndpointConnected { .. }]
    );
    assert_eq!(
        pair.client.connection(client_conn).unwrap().state(),
        State::ScConnected
    );

    // The RHE went out before any HEL, and another reverse attempt got
    // scheduled once the channel came up
    let rhe = pair.wire_frames(Side::Server, MessageType::ReverseHello);
    assert_eq!(rhe.len(), 1);
    assert!(pair
        .timers
        .keys()
        .any(|&(side, ref timer)| side == Side::Server
            && match *timer {
                Timer::ReverseRetry(..) => true,
                _ => false,
            }));
}

#[test]
fn unknown_token_closes_channel() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());
    let channel_id = pair
        .client
        .connection(client_conn)
        .unwrap()
        .current_token()
        .unwrap()
        .secure_channel_id;

    // Forge a MSG under a token id matching neither current nor precedent
    let mut forged = Vec::new();
    TcpHeader {
        message_type: MessageType::Message,
        end: ChunkEnd::Final,
        size: 0,
    }
    .encode(&mut forged);
    forged.write(channel_id);
    forged.write(0xDEAD_BEEFu32);
    forged.write(999u32); // sequence number, never reached
    forged.write(1u32);
    forged.extend_from_slice(b"payload");
    let size = forged.len();
    forged[4] = size as u8;

    pair.wire.clear();
    let time = pair.time;
    pair.server.handle(time, server_conn, &forged);
    pair.drive();

    assert_matches!(
        pair.events(Side::Server).as_slice(),
        &[Event::Disconnected { status, .. }]
            if status == StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
    );
    assert_matches!(
        pair.events(Side::Client).as_slice(),
        &[Event::Disconnected { status, .. }]
            if status == StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
    );
    let err_frames = pair.wire_frames(Side::Server, MessageType::Error);
    assert_eq!(err_frames.len(), 1);
    assert_eq!(
        decode_error_frame(&err_frames[0]).error,
        StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN
    );
}

#[test]
fn sequence_number_wraps_inside_window() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());

    pair.client
        .connection_mut(client_conn)
        .unwrap()
        .last_sn_sent = u32::max_value();
    pair.server
        .connection_mut(server_conn)
        .unwrap()
        .last_sn_received = u32::max_value();

    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&b"wrapped"[..]), 1);
    pair.drive();
    assert_matches!(
        pair.events(Side::Server).as_slice(),
        &[Event::ReceivedMessage { .. }]
    );
    // The sender restarted numbering at 1
    assert_eq!(
        pair.server
            .connection(server_conn)
            .unwrap()
            .last_sn_received,
        1
    );
}

#[test]
fn sequence_number_outside_window_is_rejected() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());

    // Next sent sequence number will be 1024: legal arithmetic for the
    // sender, but the receiver expects u32::MAX + 1 to wrap below 1024
    pair.client
        .connection_mut(client_conn)
        .unwrap()
        .last_sn_sent = 1023;
    pair.server
        .connection_mut(server_conn)
        .unwrap()
        .last_sn_received = u32::max_value();

    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&b"out of window"[..]), 1);
    pair.drive();

    let server_events = pair.events(Side::Server);
    assert_matches!(
        server_events.as_slice(),
        &[Event::Disconnected { status, .. }]
            if status == StatusCode::BAD_SECURITY_CHECKS_FAILED
    );
}

#[test]
fn request_timeout_drops_late_response() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, server_conn) = pair.connect(none_client_config());

    let time = pair.time;
    pair.client
        .send_message(time, client_conn, Bytes::from(&b"slow request"[..]), 42);
    pair.drive();
    let request_id = match pair.events(Side::Server).as_slice() {
        &[Event::ReceivedMessage { request_id, .. }] => request_id,
        other => panic!("unexpected server events: {:?}", other),
    };

    // The per-request timer expires before any response
    let fired = pair.fire(Side::Client, |t| match *t {
        Timer::Request(..) => true,
        _ => false,
    });
    assert!(fired);
    assert_matches!(
        pair.events(Side::Client).as_slice(),
        &[Event::RequestTimeout { request_handle, .. }] if request_handle == 42
    );

    // The response arrives late and is dropped without notification
    let time = pair.time;
    pair.server
        .send_message(time, server_conn, Bytes::from(&b"too late"[..]), request_id);
    pair.drive();
    assert!(pair.events(Side::Client).is_empty());
    assert_eq!(
        pair.client.connection(client_conn).unwrap().state(),
        State::ScConnected
    );
}

#[test]
fn graceful_disconnect_sends_clo() {
    let mut pair = Pair::default();
    open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, _server_conn) = pair.connect(none_client_config());
    pair.wire.clear();

    let time = pair.time;
    pair.client.disconnect(time, client_conn);
    pair.drive();

    assert_eq!(pair.wire_frames(Side::Client, MessageType::CloseChannel).len(), 1);
    assert_matches!(
        pair.events(Side::Client).as_slice(),
        &[Event::Disconnected { status, .. }]
            if status == StatusCode::BAD_SECURE_CHANNEL_CLOSED
    );
    // The server does not answer a CLO
    assert!(pair.wire_frames(Side::Server, MessageType::Error).is_empty());
    assert_matches!(
        pair.events(Side::Server).as_slice(),
        &[Event::Disconnected { .. }]
    );
}

#[test]
fn connection_establishment_timeout() {
    let mut pair = Pair::default();
    // No server endpoint: the socket connection fails immediately
    let time = pair.time;
    let conn = pair.client.connect(time, none_client_config()).unwrap();
    pair.drive();
    assert_matches!(
        pair.events(Side::Client).as_slice(),
        &[Event::ConnectionTimeout { connection }] if connection == conn
    );
}

#[test]
fn endpoint_close_tears_down_children() {
    let mut pair = Pair::default();
    let listener = open_server(&mut pair, server_endpoint_config(all_policies()));
    let (client_conn, _server_conn) = pair.connect(none_client_config());

    let time = pair.time;
    pair.server.close_endpoint(time, listener);
    pair.drive();

    let server_events = pair.events(Side::Server);
    assert!(server_events.iter().any(|e| match *e {
        Event::Disconnected { .. } => true,
        _ => false,
    }));
    assert!(server_events.iter().any(|e| match *e {
        Event::EndpointClosed { listener: l } => l == listener,
        _ => false,
    }));
    // The client learned about it through the server's ERR
    assert_matches!(
        pair.events(Side::Client).as_slice(),
        &[Event::Disconnected { connection, .. }] if connection == client_conn
    );
}

// ---- raw wire tests ---------------------------------------------------

/// A server endpoint driven with hand-built frames.
struct RawServer {
    ep: Endpoint,
    conn: ConnectionHandle,
    time: u64,
}

impl RawServer {
    fn new(config: Config, endpoint: EndpointConfig) -> RawServer {
        let mut ep = Endpoint::new(logger(), config);
        let listener = ep.open_endpoint(0, endpoint).unwrap();
        let mut listener_socket = None;
        while let Some(op) = ep.poll_io() {
            if let Io::OpenListener { .. } = op {
                listener_socket = Some(SocketId(100));
            }
        }
        ep.listener_opened(listener, listener_socket.unwrap());
        ep.accepted(0, listener, SocketId(101));
        let mut conn = None;
        while let Some(op) = ep.poll_io() {
            if let Io::Accept { connection, .. } = op {
                conn = Some(connection);
            }
        }
        RawServer {
            ep,
            conn: conn.unwrap(),
            time: 0,
        }
    }

    fn feed(&mut self, data: &[u8]) {
        let time = self.time;
        let conn = self.conn;
        self.ep.handle(time, conn, data);
    }

    fn transmits(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(op) = self.ep.poll_io() {
            if let Io::Transmit { data, .. } = op {
                frames.push(data.to_vec());
            }
        }
        frames
    }
}

fn encode_hello(
    receive_buffer_size: u32,
    send_buffer_size: u32,
    max_message_size: u32,
    max_chunk_count: u32,
) -> Vec<u8> {
    let mut buf = Vec::new();
    TcpHeader {
        message_type: MessageType::Hello,
        end: ChunkEnd::Final,
        size: 0,
    }
    .encode(&mut buf);
    ::message::Hello {
        version: 0,
        receive_buffer_size,
        send_buffer_size,
        max_message_size,
        max_chunk_count,
        endpoint_url: Some(SERVER_URL.to_string()),
    }
    .encode(&mut buf);
    let size = buf.len() as u32;
    buf[4] = size as u8;
    buf[5] = (size >> 8) as u8;
    buf
}

#[test]
fn hello_negotiation_echoes_clamped_values() {
    let mut server = RawServer::new(Config::default(), server_endpoint_config(all_policies()));
    server.feed(&encode_hello(16_000, 32_000, 0, 0));
    let frames = server.transmits();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..3], b"ACK");
    let mut buf = Cursor::new(&frames[0][8..]);
    let ack = ::message::Acknowledge::decode(&mut buf).unwrap();
    assert_eq!(ack.version, 0);
    // The server receives at most what the client will send, and sends at
    // most what the client can receive
    assert_eq!(ack.receive_buffer_size, 32_000);
    assert_eq!(ack.send_buffer_size, 16_000);
    assert_eq!(server.ep.connection(server.conn).unwrap().state(), State::ScInit);
}

#[test]
fn hello_below_minimum_buffer_is_rejected() {
    let mut server = RawServer::new(Config::default(), server_endpoint_config(all_policies()));
    server.feed(&encode_hello(4_096, 65_536, 0, 0));
    let frames = server.transmits();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..3], b"ERR");
    // BadInvalidArgument is a Table 38 status and travels unmodified
    assert_eq!(
        decode_error_frame(&frames[0]).error,
        StatusCode::BAD_INVALID_ARGUMENT
    );
}

#[test]
fn certificate_with_none_policy_is_rejected() {
    let mut server = RawServer::new(Config::default(), server_endpoint_config(all_policies()));
    server.feed(&encode_hello(65_536, 65_536, 0, 0));
    server.transmits();

    // Hand-built OPN carrying certificates along the None policy
    let mut opn = Vec::new();
    TcpHeader {
        message_type: MessageType::OpenChannel,
        end: ChunkEnd::Final,
        size: 0,
    }
    .encode(&mut opn);
    opn.write(0u32);
    ::message::AsymmetricHeader {
        policy_uri: SecurityPolicy::None.uri().to_string(),
        sender_certificate: Some(Bytes::from(CLIENT_CERT)),
        receiver_thumbprint: Some(Bytes::from(&[0u8; 20][..])),
    }
    .encode(&mut opn);
    opn.write(1u32);
    opn.write(1u32);
    let size = opn.len() as u32;
    opn[4] = size as u8;
    opn[5] = (size >> 8) as u8;
    server.feed(&opn);

    let frames = server.transmits();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..3], b"ERR");
    // OPN-phase failures leak nothing
    let err = decode_error_frame(&frames[0]);
    assert_eq!(err.error, StatusCode::BAD_SECURITY_CHECKS_FAILED);
    assert_eq!(err.reason, None);
}

#[test]
fn receiver_thumbprint_mismatch_is_rejected() {
    let mut server = RawServer::new(Config::default(), server_endpoint_config(all_policies()));
    server.feed(&encode_hello(65_536, 65_536, 0, 0));
    server.transmits();

    let mut opn = Vec::new();
    TcpHeader {
        message_type: MessageType::OpenChannel,
        end: ChunkEnd::Final,
        size: 0,
    }
    .encode(&mut opn);
    opn.write(0u32);
    ::message::AsymmetricHeader {
        policy_uri: SecurityPolicy::Basic256Sha256.uri().to_string(),
        sender_certificate: Some(Bytes::from(CLIENT_CERT)),
        // Thumbprint of something that is not the server certificate
        receiver_thumbprint: Some(Bytes::from(&[0xABu8; 20][..])),
    }
    .encode(&mut opn);
    // Body would be encrypted; the header check fires first
    opn.extend_from_slice(&[0u8; 256]);
    let size = opn.len() as u32;
    opn[4] = size as u8;
    opn[5] = (size >> 8) as u8;
    server.feed(&opn);

    let frames = server.transmits();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..3], b"ERR");
    let err = decode_error_frame(&frames[0]);
    assert_eq!(err.error, StatusCode::BAD_SECURITY_CHECKS_FAILED);
    assert_eq!(err.reason, None);
}

#[test]
fn intermediate_chunk_budget_is_enforced() {
    let mut config = Config::default();
    config.receive_max_chunk_count = 2;
    let mut server = RawServer::new(config, server_endpoint_config(all_policies()));
    server.feed(&encode_hello(65_536, 65_536, 0, 0));
    server.transmits();

    // Open the channel for real so symmetric framing applies
    let mut opn = Vec::new();
    TcpHeader {
        message_type: MessageType::OpenChannel,
        end: ChunkEnd::Final,
        size: 0,
    }
    .encode(&mut opn);
    opn.write(0u32);
    ::message::AsymmetricHeader {
        policy_uri: SecurityPolicy::None.uri().to_string(),
        sender_certificate: None,
        receiver_thumbprint: None,
    }
    .encode(&mut opn);
    ::message::SequenceHeader {
        sequence_number: 1,
        request_id: 1,
    }
    .encode(&mut opn);
    ::message::OpenChannelRequest {
        header: ::message::RequestHeader {
            timestamp: 0,
            request_handle: 1,
            timeout_hint: 0,
        },
        client_protocol_version: 0,
        request_type: ::message::OpenRequestType::Issue,
        security_mode: SecurityMode::None,
        client_nonce: None,
        requested_lifetime_ms: 60_000,
    }
    .encode(&mut opn);
    let size = opn.len() as u32;
    opn[4] = size as u8;
    opn[5] = (size >> 8) as u8;
    server.feed(&opn);
    let frames = server.transmits();
    assert_eq!(&frames.last().unwrap()[..3], b"OPN");
    let (channel_id, token_id) = {
        let token = server
            .ep
            .connection(server.conn)
            .unwrap()
            .current_token()
            .unwrap();
        (token.secure_channel_id, token.token_id)
    };

    let chunk = |end: u8, sn: u32| {
        let mut buf = Vec::new();
        TcpHeader {
            message_type: MessageType::Message,
            end: ChunkEnd::from_byte(end).unwrap(),
            size: 0,
        }
        .encode(&mut buf);
        buf.write(channel_id);
        buf.write(token_id);
        buf.write(sn);
        buf.write(9u32);
        buf.extend_from_slice(b"fragment");
        let size = buf.len() as u32;
        buf[4] = size as u8;
        buf
    };

    // A two-chunk message fits the budget of 2…
    server.feed(&chunk(b'C', 2));
    server.feed(&chunk(b'F', 3));
    let mut got_message = false;
    while let Some(event) = server.ep.poll() {
        if let Event::ReceivedMessage { .. } = event {
            got_message = true;
        }
    }
    assert!(got_message);

    // …a third chunk in one message does not
    server.feed(&chunk(b'C', 4));
    server.feed(&chunk(b'C', 5));
    let frames = server.transmits();
    assert_eq!(&frames.last().unwrap()[..3], b"ERR");
    assert_eq!(
        decode_error_frame(frames.last().unwrap()).error,
        StatusCode::BAD_TCP_MESSAGE_TOO_LARGE
    );
}
