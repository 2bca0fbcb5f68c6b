//! Endpoint lifecycle, per-endpoint connection tables and reverse-connect
//! scheduling, plus the crate's sans-I/O entry point.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::OsRng;
use slab::Slab;
use slog::{self, Logger};

use connection::{Connection, ConnectionHandle};
use crypto::{KeyPair, Pki, SecurityPolicy};
use message::ReverseHello;
use {SecurityMode, SecurityModeMask, StatusCode};

/// Tunable limits shared by every connection of one `Endpoint`.
pub struct Config {
    /// Chunk buffer for reception; the peer may negotiate it down, never
    /// below 8192.
    pub receive_buffer_size: u32,
    /// Chunk buffer for emission before negotiation.
    pub send_buffer_size: u32,
    /// Largest reassembled message body accepted; 0 for unlimited.
    pub receive_max_message_size: u32,
    /// Largest number of chunks accepted for one message; 0 for unlimited.
    pub receive_max_chunk_count: u32,
    /// Delay before an unestablished connection is torn down (ms).
    pub connection_timeout_ms: u64,
    /// Delay before a pending request is reported timed out (ms).
    pub request_timeout_ms: u64,
    /// Delay between reverse-connection attempts towards one client (ms).
    pub reverse_retry_delay_ms: u64,
    /// Clamp for the token lifetime requested by a client (ms).
    pub min_token_lifetime_ms: u32,
    pub max_token_lifetime_ms: u32,
    /// Bound on simultaneously existing secure connections.
    pub max_connections: usize,
    /// Bound on simultaneously open endpoints.
    pub max_listeners: usize,
    /// Bound on connections accepted by one listener.
    pub max_connections_per_listener: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            receive_max_message_size: 2 * 1024 * 1024,
            receive_max_chunk_count: 64,
            connection_timeout_ms: 10_000,
            request_timeout_ms: 5_000,
            reverse_retry_delay_ms: 1_000,
            min_token_lifetime_ms: 1_000,
            max_token_lifetime_ms: 3_600_000,
            max_connections: 150,
            max_listeners: 16,
            max_connections_per_listener: 64,
        }
    }
}

/// Configuration of a server endpoint (or of a purely reverse-connecting
/// one when `listens` is false).
pub struct EndpointConfig {
    pub url: String,
    /// Application URI announced in RHE messages.
    pub server_uri: String,
    /// Whether a listening socket is opened; endpoints may exist solely to
    /// host reverse connections.
    pub listens: bool,
    /// Accepted `(policy, modes)` pairs.
    pub policies: Vec<(SecurityPolicy, SecurityModeMask)>,
    pub own_certificate: Option<Bytes>,
    pub key_pair: Option<Arc<KeyPair>>,
    pub pki: Option<Arc<Pki>>,
    pub reverse_clients: Vec<ReverseClientConfig>,
}

/// A client to reach through server-initiated (reverse hello) connections.
pub struct ReverseClientConfig {
    pub url: String,
    /// Overrides `Config::reverse_retry_delay_ms` when set.
    pub retry_delay_ms: Option<u64>,
}

/// Configuration of one client-initiated secure channel.
pub struct ChannelConfig {
    pub url: String,
    pub policy: SecurityPolicy,
    pub mode: SecurityMode,
    pub requested_lifetime_ms: u32,
    /// Overrides `Config::receive_max_message_size` when non-zero.
    pub max_message_size: u32,
    pub own_certificate: Option<Bytes>,
    pub key_pair: Option<Arc<KeyPair>>,
    pub peer_certificate: Option<Bytes>,
    pub pki: Option<Arc<Pki>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SocketId(pub usize);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ListenerHandle(pub usize);

impl slog::Value for ListenerHandle {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_usize(key, self.0)
    }
}

/// Timers the embedder runs on behalf of the state machine. Each value
/// identifies one logical timer; restarting an armed timer resets it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Timer {
    /// Connection-establishment timeout.
    Establish(ConnectionHandle),
    /// Client-side security token renewal at 75 % of the token lifetime.
    TokenRenew(ConnectionHandle),
    /// Pending-request timeout, keyed by request id.
    Request(ConnectionHandle, u32),
    /// Next reverse-connection attempt towards a configured client.
    ReverseRetry(ListenerHandle, usize),
}

/// I/O operations to be immediately executed by the backend.
#[derive(Debug)]
pub enum Io {
    Transmit {
        socket: SocketId,
        data: Box<[u8]>,
    },
    /// Open a TCP connection towards `url` on behalf of `connection`.
    ConnectSocket {
        connection: ConnectionHandle,
        url: String,
    },
    /// Open a listening socket on behalf of `listener`.
    OpenListener {
        listener: ListenerHandle,
        url: String,
    },
    /// Bind an accepted socket to the connection that now owns it.
    Accept {
        socket: SocketId,
        connection: ConnectionHandle,
    },
    CloseSocket {
        socket: SocketId,
    },
    CloseListener {
        listener: ListenerHandle,
        socket: SocketId,
    },
    /// Start or reset a timer; `time` is absolute ms on the embedder's
    /// monotonic clock.
    TimerStart {
        timer: Timer,
        time: u64,
    },
    TimerStop {
        timer: Timer,
    },
}

/// Events of interest to the service layer.
#[derive(Debug)]
pub enum Event {
    /// A server endpoint accepted and established a secure channel.
    EndpointConnected {
        listener: ListenerHandle,
        connection: ConnectionHandle,
    },
    EndpointClosed {
        listener: ListenerHandle,
    },
    ReverseEndpointClosed {
        listener: ListenerHandle,
    },
    /// A client-initiated secure channel is established.
    Connected {
        connection: ConnectionHandle,
    },
    /// A secure channel initiated through a reverse endpoint is established.
    ReverseConnected {
        connection: ConnectionHandle,
        listener: ListenerHandle,
    },
    /// Establishment failed or timed out before the channel came up.
    ConnectionTimeout {
        connection: ConnectionHandle,
    },
    /// An established channel is gone. Must be acknowledged with
    /// `Endpoint::disconnected_ack` to release the connection slot.
    Disconnected {
        connection: ConnectionHandle,
        status: StatusCode,
    },
    /// A complete service message arrived. For server connections
    /// `request_id` is the peer's request id to echo into the response;
    /// for client connections it is the request handle passed to
    /// `send_message`.
    ReceivedMessage {
        connection: ConnectionHandle,
        request_id: u32,
        body: Bytes,
    },
    SendFailure {
        connection: ConnectionHandle,
        request_handle: u32,
        status: StatusCode,
    },
    RequestTimeout {
        connection: ConnectionHandle,
        request_handle: u32,
    },
}

/// Events exchanged between the connection and listener state machines
/// within one dispatch.
pub(crate) enum InternalEvent {
    ScDisconnected {
        listener: ListenerHandle,
        connection: ConnectionHandle,
        reverse_client: Option<usize>,
    },
    /// A reverse connection reached the connected state; the listener
    /// schedules the next attempt so a spare connection stays available.
    ReverseConnected {
        listener: ListenerHandle,
        reverse_client: usize,
    },
}

pub(crate) struct Context {
    pub config: Arc<Config>,
    pub rng: OsRng,
    pub io: VecDeque<Io>,
    pub events: VecDeque<Event>,
    pub internal: VecDeque<InternalEvent>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ListenerState {
    Closed,
    Opening,
    Opened,
    /// No listening socket; the listener only hosts reverse connections.
    Inactive,
}

struct Listener {
    log: Logger,
    state: ListenerState,
    /// Server endpoint configuration; `None` for client reverse endpoints.
    config: Option<Arc<EndpointConfig>>,
    url: String,
    socket: Option<SocketId>,
    /// Owned connections in insertion order.
    connections: Vec<ConnectionHandle>,
    reverse_retry_armed: Vec<bool>,
    /// Client reverse endpoint: channel configurations awaiting an RHE.
    pending_reverse: VecDeque<Arc<ChannelConfig>>,
    client_reverse: bool,
    closing: bool,
}

#[derive(Debug, Fail)]
pub enum EndpointError {
    #[fail(display = "endpoint limit reached")]
    TooManyListeners,
    #[fail(display = "endpoint already open: {}", _0)]
    DuplicateEndpoint(String),
    #[fail(display = "listening endpoint without security policies")]
    NoSecurityPolicy,
}

#[derive(Debug, Fail)]
pub enum ConnectError {
    #[fail(display = "connection limit reached")]
    TooManyConnections,
    #[fail(display = "incomplete security configuration: {}", _0)]
    IncompleteSecurity(&'static str),
    #[fail(display = "unknown or closed reverse endpoint")]
    UnknownEndpoint,
}

/// The main entry point to the library.
///
/// This object performs no I/O whatsoever. Instead, it generates a stream
/// of I/O operations for a backend to perform via `poll_io`, and consumes
/// socket bytes, socket lifecycle notifications and timer expirations via
/// `handle`, the `socket_*`/`listener_*`/`accepted` methods and `timeout`.
pub struct Endpoint {
    log: Logger,
    ctx: Context,
    listeners: Slab<Listener>,
    connections: Slab<Connection>,
}

impl Endpoint {
    pub fn new(log: Logger, config: Config) -> Endpoint {
        let rng = OsRng::new().expect("no system entropy source");
        Endpoint {
            log,
            ctx: Context {
                config: Arc::new(config),
                rng,
                io: VecDeque::new(),
                events: VecDeque::new(),
                internal: VecDeque::new(),
            },
            listeners: Slab::new(),
            connections: Slab::new(),
        }
    }

    /// Get a service-facing event.
    pub fn poll(&mut self) -> Option<Event> {
        self.ctx.events.pop_front()
    }

    /// Get a pending I/O operation.
    pub fn poll_io(&mut self) -> Option<Io> {
        self.ctx.io.pop_front()
    }

    /// Inspect a connection, e.g. for diagnostics.
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.connections.get(handle.0)
    }

    #[cfg(test)]
    pub(crate) fn connection_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.connections.get_mut(handle.0)
    }

    pub fn listener_state(&self, handle: ListenerHandle) -> Option<ListenerState> {
        self.listeners.get(handle.0).map(|l| l.state)
    }

    // ---- endpoint lifecycle ------------------------------------------

    /// Open a server endpoint (`EP_OPEN`).
    pub fn open_endpoint(
        &mut self,
        now: u64,
        config: EndpointConfig,
    ) -> Result<ListenerHandle, EndpointError> {
        if self.listeners.len() >= self.ctx.config.max_listeners {
            return Err(EndpointError::TooManyListeners);
        }
        if self.listeners.iter().any(|(_, l)| l.url == config.url) {
            return Err(EndpointError::DuplicateEndpoint(config.url));
        }
        if config.listens && config.policies.is_empty() {
            return Err(EndpointError::NoSecurityPolicy);
        }
        let config = Arc::new(config);
        let handle = ListenerHandle(self.listeners.vacant_entry().key());
        let log = self.log.new(o!("listener" => handle.0));
        let state = if config.listens {
            self.ctx.io.push_back(Io::OpenListener {
                listener: handle,
                url: config.url.clone(),
            });
            ListenerState::Opening
        } else {
            ListenerState::Inactive
        };
        info!(log, "endpoint opening"; "url" => &config.url, "listens" => config.listens);
        let listener = Listener {
            log,
            state,
            url: config.url.clone(),
            socket: None,
            connections: Vec::new(),
            reverse_retry_armed: vec![false; config.reverse_clients.len()],
            pending_reverse: VecDeque::new(),
            client_reverse: false,
            closing: false,
            config: Some(config),
        };
        self.listeners.insert(listener);
        for idx in 0..self.listeners[handle.0]
            .config
            .as_ref()
            .unwrap()
            .reverse_clients
            .len()
        {
            self.start_reverse_connection(now, handle, idx);
        }
        Ok(handle)
    }

    /// Open a client-side reverse endpoint (`REVERSE_EP_OPEN`): a listener
    /// that accepts server-initiated sockets and awaits their RHE.
    pub fn open_reverse_endpoint(&mut self, url: String) -> Result<ListenerHandle, EndpointError> {
        if self.listeners.len() >= self.ctx.config.max_listeners {
            return Err(EndpointError::TooManyListeners);
        }
        if self.listeners.iter().any(|(_, l)| l.url == url) {
            return Err(EndpointError::DuplicateEndpoint(url));
        }
        let handle = ListenerHandle(self.listeners.vacant_entry().key());
        let log = self.log.new(o!("reverse_endpoint" => handle.0));
        self.ctx.io.push_back(Io::OpenListener {
            listener: handle,
            url: url.clone(),
        });
        info!(log, "reverse endpoint opening"; "url" => &url);
        self.listeners.insert(Listener {
            log,
            state: ListenerState::Opening,
            config: None,
            url,
            socket: None,
            connections: Vec::new(),
            reverse_retry_armed: Vec::new(),
            pending_reverse: VecDeque::new(),
            client_reverse: true,
            closing: false,
        });
        Ok(handle)
    }

    /// Close an endpoint (`EP_CLOSE` / `REVERSE_EP_CLOSE`): tear down every
    /// owned connection, cancel retries, release the listening socket.
    pub fn close_endpoint(&mut self, now: u64, handle: ListenerHandle) {
        let children = match self.listeners.get_mut(handle.0) {
            Some(listener) => {
                listener.closing = true;
                for (idx, armed) in listener.reverse_retry_armed.iter_mut().enumerate() {
                    if *armed {
                        *armed = false;
                        self.ctx.io.push_back(Io::TimerStop {
                            timer: Timer::ReverseRetry(handle, idx),
                        });
                    }
                }
                listener.connections.clone()
            }
            None => return,
        };
        for conn in children {
            if let Some(connection) = self.connections.get_mut(conn.0) {
                connection.close(
                    &mut self.ctx,
                    now,
                    StatusCode::BAD_SECURE_CHANNEL_CLOSED,
                    ::connection::CloseNotify::Notify,
                );
            }
        }
        self.drain_internal(now);
        let listener = self.listeners.remove(handle.0);
        if let Some(socket) = listener.socket {
            self.ctx.io.push_back(Io::CloseListener {
                listener: handle,
                socket,
            });
        }
        info!(listener.log, "endpoint closed");
        self.ctx.events.push_back(if listener.client_reverse {
            Event::ReverseEndpointClosed { listener: handle }
        } else {
            Event::EndpointClosed { listener: handle }
        });
        self.reap();
    }

    pub fn listener_opened(&mut self, handle: ListenerHandle, socket: SocketId) {
        if let Some(listener) = self.listeners.get_mut(handle.0) {
            if listener.state == ListenerState::Opening {
                trace!(listener.log, "listening");
                listener.state = ListenerState::Opened;
                listener.socket = Some(socket);
            }
        }
    }

    pub fn listener_failure(&mut self, now: u64, handle: ListenerHandle) {
        if let Some(listener) = self.listeners.get_mut(handle.0) {
            warn!(listener.log, "listening socket failed");
            listener.socket = None;
            listener.state = ListenerState::Closed;
        }
        self.close_endpoint(now, handle);
    }

    /// A listening socket accepted a new TCP connection
    /// (`SOCKET_LISTENER_CONNECTION`).
    pub fn accepted(&mut self, now: u64, handle: ListenerHandle, socket: SocketId) {
        let (client_reverse, config, at_capacity) = match self.listeners.get(handle.0) {
            Some(listener) if listener.state == ListenerState::Opened => (
                listener.client_reverse,
                listener.config.clone(),
                listener.connections.len() >= self.ctx.config.max_connections_per_listener,
            ),
            _ => {
                self.ctx.io.push_back(Io::CloseSocket { socket });
                return;
            }
        };
        if at_capacity || self.connections.len() >= self.ctx.config.max_connections {
            debug!(self.log, "rejecting connection, table full"; "listener" => handle);
            self.ctx.io.push_back(Io::CloseSocket { socket });
            return;
        }
        let conn = ConnectionHandle(self.connections.vacant_entry().key());
        let log = self.log.new(o!("connection" => conn.0));
        let connection = if client_reverse {
            Connection::new_reverse_client(log, conn, &self.ctx.config, handle, socket)
        } else {
            Connection::new_server(
                log,
                conn,
                &self.ctx.config,
                handle,
                config.expect("server listener without configuration"),
                socket,
            )
        };
        self.connections.insert(connection);
        self.listeners[handle.0].connections.push(conn);
        self.ctx.io.push_back(Io::Accept {
            socket,
            connection: conn,
        });
        self.connections[conn.0].arm_establish_timer(&mut self.ctx, now);
    }

    // ---- client connections ------------------------------------------

    /// Initiate a secure channel towards a server (`SC_CONNECT`).
    pub fn connect(
        &mut self,
        now: u64,
        config: ChannelConfig,
    ) -> Result<ConnectionHandle, ConnectError> {
        validate_channel_security(&config)?;
        if self.connections.len() >= self.ctx.config.max_connections {
            return Err(ConnectError::TooManyConnections);
        }
        let config = Arc::new(config);
        let conn = ConnectionHandle(self.connections.vacant_entry().key());
        let log = self.log.new(o!("connection" => conn.0));
        info!(log, "connecting"; "url" => &config.url);
        let connection = Connection::new_client(log, conn, &self.ctx.config, config.clone());
        self.connections.insert(connection);
        self.ctx.io.push_back(Io::ConnectSocket {
            connection: conn,
            url: config.url.clone(),
        });
        self.connections[conn.0].arm_establish_timer(&mut self.ctx, now);
        Ok(conn)
    }

    /// Register a channel configuration to be bound to the next reverse
    /// connection accepted on `handle` (`SC_REVERSE_CONNECT`).
    pub fn reverse_connect(
        &mut self,
        handle: ListenerHandle,
        config: ChannelConfig,
    ) -> Result<(), ConnectError> {
        validate_channel_security(&config)?;
        match self.listeners.get_mut(handle.0) {
            Some(listener) if listener.client_reverse && !listener.closing => {
                listener.pending_reverse.push_back(Arc::new(config));
                Ok(())
            }
            _ => Err(ConnectError::UnknownEndpoint),
        }
    }

    /// Gracefully tear down a secure channel (`SC_DISCONNECT`).
    pub fn disconnect(&mut self, now: u64, conn: ConnectionHandle) {
        if let Some(connection) = self.connections.get_mut(conn.0) {
            connection.disconnect(&mut self.ctx, now);
        }
        self.after_dispatch(now);
    }

    /// Send a service message body (`SC_SERVICE_SND_MSG`).
    pub fn send_message(
        &mut self,
        now: u64,
        conn: ConnectionHandle,
        body: Bytes,
        request_id_or_handle: u32,
    ) {
        match self.connections.get_mut(conn.0) {
            Some(connection) => {
                connection.send_service_message(&mut self.ctx, now, body, request_id_or_handle)
            }
            None => self.ctx.events.push_back(Event::SendFailure {
                connection: conn,
                request_handle: request_id_or_handle,
                status: StatusCode::BAD_SECURE_CHANNEL_CLOSED,
            }),
        }
        self.after_dispatch(now);
    }

    /// Abort a pending server response (`SC_SERVICE_SND_ERR`).
    pub fn send_error(
        &mut self,
        now: u64,
        conn: ConnectionHandle,
        status: StatusCode,
        request_id: u32,
    ) {
        if let Some(connection) = self.connections.get_mut(conn.0) {
            connection.send_service_error(&mut self.ctx, now, status, request_id);
        }
        self.after_dispatch(now);
    }

    /// Acknowledge a `Disconnected` notification, releasing the slot
    /// (`SC_DISCONNECTED_ACK`).
    pub fn disconnected_ack(&mut self, conn: ConnectionHandle) {
        let release = match self.connections.get(conn.0) {
            Some(connection) => {
                connection.state() == ::connection::State::Closed && connection.disconnect_notified
            }
            None => false,
        };
        if release {
            self.connections.remove(conn.0);
        }
    }

    // ---- socket events -----------------------------------------------

    pub fn socket_connected(&mut self, now: u64, conn: ConnectionHandle, socket: SocketId) {
        if let Some(connection) = self.connections.get_mut(conn.0) {
            connection.on_socket_connected(&mut self.ctx, now, socket);
        }
        self.after_dispatch(now);
    }

    pub fn socket_failure(&mut self, now: u64, conn: ConnectionHandle) {
        if let Some(connection) = self.connections.get_mut(conn.0) {
            connection.on_socket_failure(&mut self.ctx, now);
        }
        self.after_dispatch(now);
    }

    /// Process bytes received on a connection's socket
    /// (`SOCKET_RCV_BYTES`).
    pub fn handle(&mut self, now: u64, conn: ConnectionHandle, data: &[u8]) {
        if !self.connections.contains(conn.0) {
            debug!(self.log, "bytes for unknown connection"; "connection" => conn.0);
            return;
        }
        let siblings = self.sibling_ids(conn);
        let mut rhe = self.connections[conn.0].handle_data(&mut self.ctx, now, data, &siblings);
        while let Some(reverse_hello) = rhe {
            let config = self.match_pending_reverse(conn, &reverse_hello);
            self.connections[conn.0].on_reverse_hello(&mut self.ctx, now, reverse_hello, config);
            rhe = self.connections[conn.0].handle_data(&mut self.ctx, now, &[], &siblings);
        }
        self.after_dispatch(now);
    }

    /// Handle a timer expiring.
    pub fn timeout(&mut self, now: u64, timer: Timer) {
        match timer {
            Timer::ReverseRetry(listener, idx) => {
                let due = match self.listeners.get_mut(listener.0) {
                    Some(l) if !l.closing => {
                        let due = l.reverse_retry_armed.get(idx).cloned().unwrap_or(false);
                        if due {
                            l.reverse_retry_armed[idx] = false;
                        }
                        due
                    }
                    _ => false,
                };
                if due {
                    self.start_reverse_connection(now, listener, idx);
                }
            }
            Timer::Establish(conn) | Timer::TokenRenew(conn) | Timer::Request(conn, _) => {
                if let Some(connection) = self.connections.get_mut(conn.0) {
                    connection.on_timeout(&mut self.ctx, now, timer);
                }
                self.after_dispatch(now);
            }
        }
    }

    // ---- internals ---------------------------------------------------

    /// Live `(secureChannelId, tokenId)` pairs of the other connections on
    /// the listener owning `conn`, used for fresh-id generation.
    fn sibling_ids(&self, conn: ConnectionHandle) -> Vec<(u32, u32)> {
        let listener = match self.connections[conn.0].listener {
            Some(listener) => listener,
            None => return Vec::new(),
        };
        let listener = match self.listeners.get(listener.0) {
            Some(listener) => listener,
            None => return Vec::new(),
        };
        listener
            .connections
            .iter()
            .filter(|&&c| c != conn)
            .filter_map(|&c| self.connections.get(c.0))
            .filter(|c| c.state() != ::connection::State::Closed)
            .filter_map(|c| {
                c.current_token()
                    .map(|t| (t.secure_channel_id, t.token_id))
            })
            .collect()
    }

    /// Bind an inbound RHE to the first pending reverse-connect request
    /// with a matching endpoint URL.
    fn match_pending_reverse(
        &mut self,
        conn: ConnectionHandle,
        rhe: &ReverseHello,
    ) -> Option<Arc<ChannelConfig>> {
        let listener = self.connections[conn.0].listener?;
        let listener = self.listeners.get_mut(listener.0)?;
        match rhe.endpoint_url {
            Some(ref url) => {
                let idx = listener
                    .pending_reverse
                    .iter()
                    .position(|c| c.url.eq_ignore_ascii_case(url))?;
                listener.pending_reverse.remove(idx)
            }
            None => listener.pending_reverse.pop_front(),
        }
    }

    fn start_reverse_connection(&mut self, now: u64, handle: ListenerHandle, idx: usize) {
        let (config, url) = match self.listeners.get(handle.0) {
            Some(listener) if !listener.closing => {
                let config = listener.config.clone().expect("reverse without config");
                match config.reverse_clients.get(idx) {
                    Some(client) => (config.clone(), client.url.clone()),
                    None => return,
                }
            }
            _ => return,
        };
        if self.connections.len() >= self.ctx.config.max_connections
            || self.listeners[handle.0].connections.len()
                >= self.ctx.config.max_connections_per_listener
        {
            // No room right now; try again after the retry delay
            self.arm_reverse_retry(now, handle, idx);
            return;
        }
        let conn = ConnectionHandle(self.connections.vacant_entry().key());
        let log = self.log.new(o!("connection" => conn.0));
        trace!(log, "reverse connection attempt"; "url" => &url[..], "client" => idx);
        let connection =
            Connection::new_reverse_server(log, conn, &self.ctx.config, handle, config, idx);
        self.connections.insert(connection);
        self.listeners[handle.0].connections.push(conn);
        self.ctx.io.push_back(Io::ConnectSocket {
            connection: conn,
            url,
        });
        self.connections[conn.0].arm_establish_timer(&mut self.ctx, now);
    }

    fn arm_reverse_retry(&mut self, now: u64, handle: ListenerHandle, idx: usize) {
        let delay = {
            let listener = match self.listeners.get_mut(handle.0) {
                Some(listener) if !listener.closing => listener,
                _ => return,
            };
            if listener.reverse_retry_armed.get(idx).cloned().unwrap_or(true) {
                return;
            }
            listener.reverse_retry_armed[idx] = true;
            listener
                .config
                .as_ref()
                .and_then(|c| c.reverse_clients[idx].retry_delay_ms)
                .unwrap_or(self.ctx.config.reverse_retry_delay_ms)
        };
        self.ctx.io.push_back(Io::TimerStart {
            timer: Timer::ReverseRetry(handle, idx),
            time: now + delay,
        });
    }

    fn after_dispatch(&mut self, now: u64) {
        self.drain_internal(now);
        self.reap();
    }

    fn drain_internal(&mut self, now: u64) {
        while let Some(event) = self.ctx.internal.pop_front() {
            match event {
                InternalEvent::ScDisconnected {
                    listener,
                    connection,
                    reverse_client,
                } => {
                    if let Some(l) = self.listeners.get_mut(listener.0) {
                        l.connections.retain(|&c| c != connection);
                    }
                    if let Some(idx) = reverse_client {
                        self.arm_reverse_retry(now, listener, idx);
                    }
                }
                InternalEvent::ReverseConnected {
                    listener,
                    reverse_client,
                } => {
                    self.arm_reverse_retry(now, listener, reverse_client);
                }
            }
        }
    }

    /// Drop closed connections whose disappearance needs no acknowledgment.
    fn reap(&mut self) {
        let dead: Vec<usize> = self
            .connections
            .iter()
            .filter(|&(_, c)| c.state() == ::connection::State::Closed && !c.disconnect_notified)
            .map(|(key, _)| key)
            .collect();
        for key in dead {
            self.connections.remove(key);
        }
    }
}

fn validate_channel_security(config: &ChannelConfig) -> Result<(), ConnectError> {
    match config.mode {
        SecurityMode::None => {
            if config.policy != SecurityPolicy::None {
                return Err(ConnectError::IncompleteSecurity(
                    "security mode None requires the None policy",
                ));
            }
        }
        SecurityMode::Sign | SecurityMode::SignAndEncrypt => {
            if config.policy == SecurityPolicy::None {
                return Err(ConnectError::IncompleteSecurity(
                    "secured mode requires a security policy",
                ));
            }
            if config.key_pair.is_none() || config.own_certificate.is_none() {
                return Err(ConnectError::IncompleteSecurity(
                    "secured mode requires the application certificate and key",
                ));
            }
            if config.peer_certificate.is_none() || config.pki.is_none() {
                return Err(ConnectError::IncompleteSecurity(
                    "secured mode requires the peer certificate and a PKI",
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_consistent() {
        let config = Config::default();
        assert!(config.receive_buffer_size >= ::MIN_BUFFER_SIZE);
        assert!(config.send_buffer_size >= ::MIN_BUFFER_SIZE);
        assert!(config.min_token_lifetime_ms <= config.max_token_lifetime_ms);
    }

    #[test]
    fn channel_security_validation() {
        let mut config = ChannelConfig {
            url: "opc.tcp://localhost:4840".to_string(),
            policy: SecurityPolicy::None,
            mode: SecurityMode::None,
            requested_lifetime_ms: 60_000,
            max_message_size: 0,
            own_certificate: None,
            key_pair: None,
            peer_certificate: None,
            pki: None,
        };
        assert!(validate_channel_security(&config).is_ok());
        config.mode = SecurityMode::Sign;
        assert!(validate_channel_security(&config).is_err());
        config.policy = SecurityPolicy::Basic256Sha256;
        assert!(validate_channel_security(&config).is_err());
    }
}
