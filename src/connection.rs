//! Per-connection secure channel state machine.

use std::sync::Arc;

use bytes::Bytes;
use fnv::FnvHashMap;
use slog::Logger;

use chunk::ChunkCtx;
use crypto::{Crypto, KeySets, PeerIdentity, SecurityPolicy};
use endpoint::{
    ChannelConfig, Config, Context, EndpointConfig, Event, InternalEvent, Io, ListenerHandle,
    SocketId, Timer,
};
use message::{
    Acknowledge, CloseChannelRequest, ErrorMessage, Hello, MessageType, OpenChannelRequest,
    OpenChannelResponse, OpenRequestType, RequestHeader, ResponseHeader, ReverseHello,
};
use {coding, SecurityMode, SecurityModeMask, Side, StatusCode, MIN_BUFFER_SIZE, PROTOCOL_VERSION};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

impl slog::Value for ConnectionHandle {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_usize(key, self.0)
    }
}

/// Life cycle of a secure connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    Closed,
    /// Server: socket connection towards a reverse client requested.
    /// Client: socket accepted on a reverse endpoint, RHE awaited.
    TcpReverseInit,
    /// Server: HEL awaited. Client: socket connection requested.
    TcpInit,
    /// Client: HEL sent, ACK awaited.
    TcpNegotiate,
    /// Server: ACK sent, OPN awaited.
    ScInit,
    /// Client: OPN issue sent, response awaited.
    ScConnecting,
    ScConnected,
    ScConnectedRenew,
}

impl State {
    pub fn is_connected(self) -> bool {
        match self {
            State::ScConnected | State::ScConnectedRenew => true,
            _ => false,
        }
    }
}

/// A security token and its validity window (Part 4 §5.5.2).
#[derive(Debug, Clone)]
pub struct SecurityToken {
    pub secure_channel_id: u32,
    pub token_id: u32,
    pub created_at: i64,
    pub revised_lifetime_ms: u32,
    /// End of validity on the embedder's monotonic clock.
    pub lifetime_end: u64,
}

impl SecurityToken {
    /// Token expiry check; a client keeps accepting for 25 % of the revised
    /// lifetime past expiry (Part 4 §5.5.2.1).
    pub fn is_valid(&self, side: Side, now: u64) -> bool {
        if now <= self.lifetime_end {
            return true;
        }
        side.is_client() && now - self.lifetime_end <= u64::from(self.revised_lifetime_ms) / 4
    }
}

/// Negotiated TCP-level limits (Part 6 Tables 36/37).
#[derive(Debug, Copy, Clone)]
pub struct TcpProperties {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    /// Limits on reassembled message bodies; 0 means unlimited.
    pub receive_max_message_size: u32,
    pub send_max_message_size: u32,
    pub receive_max_chunk_count: u32,
    pub send_max_chunk_count: u32,
}

impl TcpProperties {
    fn new(config: &Config) -> TcpProperties {
        TcpProperties {
            protocol_version: PROTOCOL_VERSION,
            receive_buffer_size: config.receive_buffer_size,
            send_buffer_size: config.send_buffer_size,
            receive_max_message_size: config.receive_max_message_size,
            send_max_message_size: config.receive_max_message_size,
            receive_max_chunk_count: config.receive_max_chunk_count,
            send_max_chunk_count: config.receive_max_chunk_count,
        }
    }
}

/// Context of a client request awaiting its response.
pub(crate) struct SentRequest {
    pub timeout_expired: bool,
    pub request_handle: u32,
    pub msg_type: MessageType,
    pub timer_armed: bool,
}

pub struct Connection {
    log: Logger,
    pub(crate) handle: ConnectionHandle,
    pub(crate) side: Side,
    pub(crate) state: State,
    pub(crate) socket: Option<SocketId>,
    /// Owning listener (server) or reverse endpoint (client reverse).
    pub(crate) listener: Option<ListenerHandle>,
    /// Index of the reverse client in the endpoint configuration, for
    /// server-initiated reverse connections.
    pub(crate) reverse_client: Option<usize>,
    pub(crate) channel_config: Option<Arc<ChannelConfig>>,
    pub(crate) endpoint_config: Option<Arc<EndpointConfig>>,
    pub(crate) tcp: TcpProperties,
    pub(crate) chunks: ChunkCtx,
    pub(crate) crypto: Option<Crypto>,
    pub(crate) current_token: Option<SecurityToken>,
    pub(crate) precedent_token: Option<SecurityToken>,
    pub(crate) current_keys: Option<KeySets>,
    pub(crate) precedent_keys: Option<KeySets>,
    /// Server only: a message secured with the current (renewed) token has
    /// been received, so the precedent token is no longer accepted and the
    /// current one is used for sending.
    pub(crate) server_new_token_active: bool,
    pub(crate) peer_identity: Option<Box<PeerIdentity>>,
    /// Server: client certificate recorded from the OPN request header.
    pub(crate) peer_certificate: Option<Bytes>,
    /// Client: own nonce between OPN emission and response processing.
    /// Server: client nonce between OPN request decode and key derivation.
    pub(crate) client_nonce: Option<Vec<u8>>,
    /// Server: policy of a pending OPN issue, fixed by the asymmetric
    /// header before the body announces the mode.
    pub(crate) pending_policy: Option<SecurityPolicy>,
    /// Server: security modes accepted for `pending_policy`.
    pub(crate) accepted_modes: Option<SecurityModeMask>,
    pub(crate) last_sn_sent: u32,
    pub(crate) last_sn_received: u32,
    pub(crate) next_request_id: u32,
    pub(crate) sent_requests: FnvHashMap<u32, SentRequest>,
    pub(crate) establish_timer_armed: bool,
    pub(crate) renew_timer_armed: bool,
    /// Set once `Disconnected` has been raised; the slot is retained until
    /// the embedder acknowledges.
    pub(crate) disconnect_notified: bool,
    /// Test hook: fail the encoding of the n-th chunk (0-based) of the next
    /// outbound message to exercise the abort path.
    #[cfg(test)]
    pub(crate) fail_chunk_encode: Option<u32>,
}

impl Connection {
    fn new(
        log: Logger,
        handle: ConnectionHandle,
        side: Side,
        state: State,
        config: &Config,
    ) -> Connection {
        Connection {
            log,
            handle,
            side,
            state,
            socket: None,
            listener: None,
            reverse_client: None,
            channel_config: None,
            endpoint_config: None,
            tcp: TcpProperties::new(config),
            chunks: ChunkCtx::new(),
            crypto: None,
            current_token: None,
            precedent_token: None,
            current_keys: None,
            precedent_keys: None,
            server_new_token_active: false,
            peer_identity: None,
            peer_certificate: None,
            client_nonce: None,
            pending_policy: None,
            accepted_modes: None,
            last_sn_sent: 0,
            last_sn_received: 0,
            next_request_id: 1,
            sent_requests: FnvHashMap::default(),
            establish_timer_armed: false,
            renew_timer_armed: false,
            disconnect_notified: false,
            #[cfg(test)]
            fail_chunk_encode: None,
        }
    }

    pub(crate) fn new_client(
        log: Logger,
        handle: ConnectionHandle,
        config: &Config,
        channel_config: Arc<ChannelConfig>,
    ) -> Connection {
        let mut conn = Connection::new(log, handle, Side::Client, State::TcpInit, config);
        if channel_config.max_message_size != 0 {
            conn.tcp.receive_max_message_size = channel_config.max_message_size;
            conn.tcp.send_max_message_size = channel_config.max_message_size;
        }
        conn.channel_config = Some(channel_config);
        conn
    }

    pub(crate) fn new_server(
        log: Logger,
        handle: ConnectionHandle,
        config: &Config,
        listener: ListenerHandle,
        endpoint_config: Arc<EndpointConfig>,
        socket: SocketId,
    ) -> Connection {
        let mut conn = Connection::new(log, handle, Side::Server, State::TcpInit, config);
        conn.listener = Some(listener);
        conn.endpoint_config = Some(endpoint_config);
        conn.socket = Some(socket);
        conn
    }

    pub(crate) fn new_reverse_server(
        log: Logger,
        handle: ConnectionHandle,
        config: &Config,
        listener: ListenerHandle,
        endpoint_config: Arc<EndpointConfig>,
        reverse_client: usize,
    ) -> Connection {
        let mut conn = Connection::new(log, handle, Side::Server, State::TcpReverseInit, config);
        conn.listener = Some(listener);
        conn.endpoint_config = Some(endpoint_config);
        conn.reverse_client = Some(reverse_client);
        conn
    }

    pub(crate) fn new_reverse_client(
        log: Logger,
        handle: ConnectionHandle,
        config: &Config,
        listener: ListenerHandle,
        socket: SocketId,
    ) -> Connection {
        let mut conn = Connection::new(log, handle, Side::Client, State::TcpReverseInit, config);
        conn.listener = Some(listener);
        conn.socket = Some(socket);
        conn
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// The security token currently used for sending.
    pub fn current_token(&self) -> Option<&SecurityToken> {
        self.current_token.as_ref()
    }

    pub(crate) fn is_reverse(&self) -> bool {
        self.reverse_client.is_some() || (self.side.is_client() && self.listener.is_some())
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    fn config(&self) -> Arc<ChannelConfig> {
        self.channel_config
            .clone()
            .expect("channel configuration not set")
    }

    // ---- timers ------------------------------------------------------

    pub(crate) fn arm_establish_timer(&mut self, ctx: &mut Context, now: u64) {
        self.establish_timer_armed = true;
        ctx.io.push_back(Io::TimerStart {
            timer: Timer::Establish(self.handle),
            time: now + ctx.config.connection_timeout_ms,
        });
    }

    fn cancel_establish_timer(&mut self, ctx: &mut Context) {
        if self.establish_timer_armed {
            self.establish_timer_armed = false;
            ctx.io.push_back(Io::TimerStop {
                timer: Timer::Establish(self.handle),
            });
        }
    }

    fn arm_renew_timer(&mut self, ctx: &mut Context, now: u64, revised_lifetime_ms: u32) {
        // Part 4: clients should renew after 75 % of the token lifetime
        self.renew_timer_armed = true;
        ctx.io.push_back(Io::TimerStart {
            timer: Timer::TokenRenew(self.handle),
            time: now + u64::from(revised_lifetime_ms) * 3 / 4,
        });
    }

    fn cancel_renew_timer(&mut self, ctx: &mut Context) {
        if self.renew_timer_armed {
            self.renew_timer_armed = false;
            ctx.io.push_back(Io::TimerStop {
                timer: Timer::TokenRenew(self.handle),
            });
        }
    }

    pub(crate) fn on_timeout(&mut self, ctx: &mut Context, now: u64, timer: Timer) {
        match timer {
            Timer::Establish(_) => {
                if !self.establish_timer_armed {
                    return;
                }
                self.establish_timer_armed = false;
                if self.state.is_connected() {
                    return;
                }
                debug!(self.log, "connection establishment timed out");
                self.close(ctx, now, StatusCode::BAD_TIMEOUT, CloseNotify::Timeout);
            }
            Timer::TokenRenew(_) => {
                if !self.renew_timer_armed {
                    return;
                }
                self.renew_timer_armed = false;
                if self.state == State::ScConnected && self.side.is_client() {
                    self.client_send_renew(ctx, now);
                }
            }
            Timer::Request(_, request_id) => {
                let notify = match self.sent_requests.get_mut(&request_id) {
                    Some(entry) if entry.timer_armed => {
                        entry.timer_armed = false;
                        entry.timeout_expired = true;
                        if entry.msg_type == MessageType::Message {
                            Some(entry.request_handle)
                        } else {
                            None
                        }
                    }
                    _ => return,
                };
                // The slot stays registered so a late response is decoded
                // and silently dropped
                if let Some(request_handle) = notify {
                    ctx.events.push_back(Event::RequestTimeout {
                        connection: self.handle,
                        request_handle,
                    });
                }
            }
            Timer::ReverseRetry(..) => unreachable!("listener timer routed to a connection"),
        }
    }

    // ---- socket lifecycle --------------------------------------------

    pub(crate) fn on_socket_connected(&mut self, ctx: &mut Context, now: u64, socket: SocketId) {
        self.socket = Some(socket);
        match (self.state, self.side) {
            (State::TcpInit, Side::Client) => {
                self.send_hello(ctx);
                self.state = State::TcpNegotiate;
            }
            (State::TcpReverseInit, Side::Server) => {
                let config = self
                    .endpoint_config
                    .clone()
                    .expect("server connection without endpoint configuration");
                trace!(self.log, "sending RHE"; "url" => &config.url);
                self.send_plain(
                    ctx,
                    MessageType::ReverseHello,
                    &ReverseHello {
                        server_uri: Some(config.server_uri.clone()),
                        endpoint_url: Some(config.url.clone()),
                    },
                );
                self.state = State::TcpInit;
            }
            _ => {
                debug!(self.log, "unexpected socket connection"; "state" => ?self.state);
                self.close_immediate(ctx, now, StatusCode::BAD_INVALID_STATE);
            }
        }
    }

    pub(crate) fn on_socket_failure(&mut self, ctx: &mut Context, now: u64) {
        debug!(self.log, "socket failure");
        self.socket = None;
        self.close_immediate(ctx, now, StatusCode::BAD_CONNECTION_CLOSED);
    }

    fn send_hello(&mut self, ctx: &mut Context) {
        let url = self.config().url.clone();
        let hello = Hello {
            version: self.tcp.protocol_version,
            receive_buffer_size: self.tcp.receive_buffer_size,
            send_buffer_size: self.tcp.send_buffer_size,
            max_message_size: self.tcp.receive_max_message_size,
            max_chunk_count: self.tcp.receive_max_chunk_count,
            endpoint_url: Some(url),
        };
        trace!(self.log, "sending HEL";
               "rcv_buf" => hello.receive_buffer_size, "snd_buf" => hello.send_buffer_size);
        self.send_plain(ctx, MessageType::Hello, &hello);
    }

    // ---- inbound plain messages --------------------------------------

    pub(crate) fn on_hello(&mut self, ctx: &mut Context, hello: Hello) -> Result<(), StatusCode> {
        if self.state != State::TcpInit || !self.side.is_server() {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }
        if self.tcp.protocol_version > hello.version {
            // Use the last version supported by the client
            self.tcp.protocol_version = hello.version;
        }
        // Shrink the send side to what the peer can receive and the receive
        // side to what the peer will ever send
        self.tcp.send_buffer_size =
            negotiate_buffer(self.tcp.send_buffer_size, hello.receive_buffer_size)?;
        self.tcp.receive_buffer_size =
            negotiate_buffer(self.tcp.receive_buffer_size, hello.send_buffer_size)?;
        self.tcp.send_max_message_size =
            negotiate_limit(self.tcp.send_max_message_size, hello.max_message_size);
        self.tcp.send_max_chunk_count =
            negotiate_limit(self.tcp.send_max_chunk_count, hello.max_chunk_count);
        self.tcp.receive_max_message_size =
            negotiate_limit(self.tcp.receive_max_message_size, hello.max_message_size);
        self.tcp.receive_max_chunk_count =
            negotiate_limit(self.tcp.receive_max_chunk_count, hello.max_chunk_count);

        if let (&Some(ref url), &Some(ref config)) = (&hello.endpoint_url, &self.endpoint_config) {
            if !url.eq_ignore_ascii_case(&config.url) {
                // Forwarding to sibling endpoints on the same port is not
                // supported; the configured endpoint keeps the connection
                warn!(self.log, "hello endpoint url differs from configured url";
                      "requested" => &url[..], "configured" => &config.url[..]);
            }
        }

        let ack = Acknowledge {
            version: self.tcp.protocol_version,
            receive_buffer_size: self.tcp.receive_buffer_size,
            send_buffer_size: self.tcp.send_buffer_size,
            max_message_size: self.tcp.receive_max_message_size,
            max_chunk_count: self.tcp.receive_max_chunk_count,
        };
        trace!(self.log, "sending ACK";
               "rcv_buf" => ack.receive_buffer_size, "snd_buf" => ack.send_buffer_size);
        self.send_plain(ctx, MessageType::Acknowledge, &ack);
        self.state = State::ScInit;
        Ok(())
    }

    pub(crate) fn on_acknowledge(
        &mut self,
        ctx: &mut Context,
        now: u64,
        ack: Acknowledge,
    ) -> Result<(), StatusCode> {
        if self.state != State::TcpNegotiate || !self.side.is_client() {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }
        if ack.version > self.tcp.protocol_version {
            return Err(StatusCode::BAD_PROTOCOL_VERSION_UNSUPPORTED);
        }
        self.tcp.protocol_version = ack.version;
        self.tcp.send_buffer_size =
            negotiate_buffer(self.tcp.send_buffer_size, ack.receive_buffer_size)?;
        self.tcp.receive_buffer_size =
            negotiate_buffer(self.tcp.receive_buffer_size, ack.send_buffer_size)?;
        self.tcp.send_max_message_size =
            negotiate_limit(self.tcp.send_max_message_size, ack.max_message_size);
        self.tcp.send_max_chunk_count =
            negotiate_limit(self.tcp.send_max_chunk_count, ack.max_chunk_count);
        trace!(self.log, "negotiated";
               "snd_buf" => self.tcp.send_buffer_size, "rcv_buf" => self.tcp.receive_buffer_size);
        self.state = State::ScInit;
        self.client_send_issue(ctx, now)
    }

    pub(crate) fn on_error_message(&mut self, ctx: &mut Context, now: u64, err: ErrorMessage) {
        debug!(self.log, "received ERR"; "status" => err.error,
               "reason" => err.reason.as_ref().map_or("", |s| &s[..]));
        // The peer closes its socket right after sending ERR
        self.close(ctx, now, err.error, CloseNotify::PeerNotified);
    }

    pub(crate) fn on_reverse_hello(
        &mut self,
        ctx: &mut Context,
        now: u64,
        rhe: ReverseHello,
        channel_config: Option<Arc<ChannelConfig>>,
    ) {
        if self.state != State::TcpReverseInit || !self.side.is_client() {
            debug!(self.log, "unexpected RHE"; "state" => ?self.state);
            self.close_immediate(ctx, now, StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
            return;
        }
        let config = match channel_config {
            Some(config) => config,
            None => {
                debug!(self.log, "RHE without pending reverse connection request";
                       "url" => rhe.endpoint_url.as_ref().map_or("", |s| &s[..]));
                self.close_immediate(ctx, now, StatusCode::BAD_TCP_ENDPOINT_URL_INVALID);
                return;
            }
        };
        trace!(self.log, "RHE associated with pending connection";
               "server_uri" => rhe.server_uri.as_ref().map_or("", |s| &s[..]));
        if config.max_message_size != 0 {
            self.tcp.receive_max_message_size = config.max_message_size;
            self.tcp.send_max_message_size = config.max_message_size;
        }
        self.channel_config = Some(config);
        self.state = State::TcpInit;
        self.send_hello(ctx);
        self.state = State::TcpNegotiate;
    }

    // ---- client OPN --------------------------------------------------

    fn client_send_issue(&mut self, ctx: &mut Context, now: u64) -> Result<(), StatusCode> {
        let config = self.config();
        let crypto = Crypto::new(config.policy, config.mode);
        if crypto.is_signed() {
            let pki = config
                .pki
                .as_ref()
                .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            let peer_cert = config
                .peer_certificate
                .as_ref()
                .ok_or(StatusCode::BAD_CERTIFICATE_INVALID)?;
            pki.validate(peer_cert, config.policy)?;
            self.peer_identity = Some(pki.peer_identity(peer_cert)?);
        }
        let nonce = crypto.generate_nonce(&mut ctx.rng);
        let request = OpenChannelRequest {
            header: RequestHeader {
                timestamp: now as i64,
                request_handle: 0,
                timeout_hint: ctx.config.request_timeout_ms as u32,
            },
            client_protocol_version: self.tcp.protocol_version,
            request_type: OpenRequestType::Issue,
            security_mode: config.mode,
            client_nonce: if crypto.is_signed() {
                Some(Bytes::from(&nonce[..]))
            } else {
                None
            },
            requested_lifetime_ms: config
                .requested_lifetime_ms
                .max(ctx.config.min_token_lifetime_ms),
        };
        self.client_nonce = Some(nonce);
        self.crypto = Some(crypto);
        let mut body = Vec::new();
        coding::Codec::encode(&request, &mut body);
        trace!(self.log, "sending OPN issue"; "policy" => config.policy.uri());
        self.send_open_channel(ctx, now, body.into(), 0)?;
        self.state = State::ScConnecting;
        Ok(())
    }

    fn client_send_renew(&mut self, ctx: &mut Context, now: u64) {
        let config = self.config();
        let (signed, nonce) = {
            let crypto = self.crypto.as_ref().expect("renew without crypto context");
            (crypto.is_signed(), crypto.generate_nonce(&mut ctx.rng))
        };
        let request = OpenChannelRequest {
            header: RequestHeader {
                timestamp: now as i64,
                request_handle: 0,
                timeout_hint: ctx.config.request_timeout_ms as u32,
            },
            client_protocol_version: self.tcp.protocol_version,
            request_type: OpenRequestType::Renew,
            security_mode: config.mode,
            client_nonce: if signed {
                Some(Bytes::from(&nonce[..]))
            } else {
                None
            },
            requested_lifetime_ms: config
                .requested_lifetime_ms
                .max(ctx.config.min_token_lifetime_ms),
        };
        self.client_nonce = Some(nonce);
        let mut body = Vec::new();
        coding::Codec::encode(&request, &mut body);
        trace!(self.log, "sending OPN renew");
        if let Err(status) = self.send_open_channel(ctx, now, body.into(), 0) {
            debug!(self.log, "failed to send OPN renew"; "status" => status);
            self.close(ctx, now, status, CloseNotify::Notify);
            return;
        }
        self.state = State::ScConnectedRenew;
    }

    /// Validate an OPN response and install the new token (spec §4.2.1).
    pub(crate) fn on_open_channel_response(
        &mut self,
        ctx: &mut Context,
        now: u64,
        response: OpenChannelResponse,
        header_channel_id: u32,
    ) -> Result<(), StatusCode> {
        if !self.side.is_client() {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }
        let renew = match self.state {
            State::ScConnecting => false,
            State::ScConnectedRenew => true,
            _ => return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID),
        };
        if response.header.service_result.is_bad() {
            return Err(response.header.service_result);
        }
        if response.server_protocol_version != self.tcp.protocol_version {
            return Err(StatusCode::BAD_PROTOCOL_VERSION_UNSUPPORTED);
        }
        if response.channel_id == 0
            || response.token_id == 0
            || response.channel_id != header_channel_id
        {
            return Err(StatusCode::BAD_SECURE_CHANNEL_ID_INVALID);
        }
        if renew {
            let current = self.current_token.as_ref().expect("renew without token");
            if response.channel_id != current.secure_channel_id {
                return Err(StatusCode::BAD_SECURE_CHANNEL_ID_INVALID);
            }
            if response.token_id == current.token_id {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
        }

        let keys = {
            let crypto = self.crypto.as_ref().expect("OPN response without crypto");
            if crypto.is_signed() {
                let client_nonce = self
                    .client_nonce
                    .take()
                    .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
                let server_nonce = response
                    .server_nonce
                    .as_ref()
                    .ok_or(StatusCode::BAD_NONCE_INVALID)?;
                if server_nonce.len() != crypto.policy().nonce_length() {
                    return Err(StatusCode::BAD_NONCE_INVALID);
                }
                Some(crypto.derive_client_key_sets(&client_nonce, server_nonce))
            } else {
                None
            }
        };

        let token = SecurityToken {
            secure_channel_id: response.channel_id,
            token_id: response.token_id,
            created_at: response.created_at,
            revised_lifetime_ms: response.revised_lifetime_ms,
            lifetime_end: now + u64::from(response.revised_lifetime_ms),
        };
        self.install_token(token, keys);
        self.arm_renew_timer(ctx, now, response.revised_lifetime_ms);
        if renew {
            trace!(self.log, "token renewed";
                   "token_id" => response.token_id, "lifetime" => response.revised_lifetime_ms);
        } else {
            info!(self.log, "secure channel established";
                  "channel_id" => response.channel_id, "token_id" => response.token_id);
            self.cancel_establish_timer(ctx);
            if self.is_reverse() {
                ctx.events.push_back(Event::ReverseConnected {
                    connection: self.handle,
                    listener: self.listener.expect("reverse connection without listener"),
                });
            } else {
                ctx.events.push_back(Event::Connected {
                    connection: self.handle,
                });
            }
        }
        self.state = State::ScConnected;
        Ok(())
    }

    // ---- server OPN --------------------------------------------------

    /// Process an OPN request on the server.
    ///
    /// `siblings` holds `(secure_channel_id, token_id)` of the other live
    /// connections on the owning listener, for collision avoidance.
    pub(crate) fn on_open_channel_request(
        &mut self,
        ctx: &mut Context,
        now: u64,
        request: OpenChannelRequest,
        request_id: u32,
        siblings: &[(u32, u32)],
    ) -> Result<(), StatusCode> {
        if !self.side.is_server() {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }
        if request.client_protocol_version != self.tcp.protocol_version {
            return Err(StatusCode::BAD_PROTOCOL_VERSION_UNSUPPORTED);
        }
        match (self.state, request.request_type) {
            (State::ScInit, OpenRequestType::Issue) => {
                self.server_issue(ctx, now, request, request_id, siblings)
            }
            (State::ScConnected, OpenRequestType::Renew) => {
                self.state = State::ScConnectedRenew;
                self.server_renew(ctx, now, request, request_id, siblings)
            }
            _ => Err(StatusCode::BAD_SECURITY_CHECKS_FAILED),
        }
    }

    fn server_issue(
        &mut self,
        ctx: &mut Context,
        now: u64,
        request: OpenChannelRequest,
        request_id: u32,
        siblings: &[(u32, u32)],
    ) -> Result<(), StatusCode> {
        let policy = self
            .pending_policy
            .take()
            .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
        let accepted = self
            .accepted_modes
            .take()
            .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
        if !accepted.contains(request.security_mode) {
            return Err(StatusCode::BAD_SECURITY_MODE_REJECTED);
        }
        // The mode announced in the body must match what the certificates
        // in the asymmetric header implied
        let secured = self.peer_certificate.is_some();
        if secured != (request.security_mode != SecurityMode::None) {
            return Err(StatusCode::BAD_CERTIFICATE_USE_NOT_ALLOWED);
        }
        let crypto = Crypto::new(policy, request.security_mode);

        let client_nonce = if crypto.is_signed() {
            let nonce = request
                .client_nonce
                .as_ref()
                .ok_or(StatusCode::BAD_NONCE_INVALID)?;
            if nonce.len() != policy.nonce_length() {
                return Err(StatusCode::BAD_NONCE_INVALID);
            }
            nonce.to_vec()
        } else {
            Vec::new()
        };
        self.crypto = Some(crypto);

        let (channel_id, token_id) = fresh_channel_and_token_ids(ctx, siblings)?;
        let revised_lifetime_ms = revise_lifetime(&ctx.config, request.requested_lifetime_ms);
        let token = SecurityToken {
            secure_channel_id: channel_id,
            token_id,
            created_at: now as i64,
            revised_lifetime_ms,
            lifetime_end: now + u64::from(revised_lifetime_ms),
        };
        let (keys, server_nonce) = self.server_derive(ctx, &client_nonce);
        self.install_token(token, keys);
        self.server_new_token_active = true;

        self.send_open_channel_response(ctx, now, &request, request_id, server_nonce)?;
        self.cancel_establish_timer(ctx);
        self.state = State::ScConnected;
        info!(self.log, "secure channel established";
              "channel_id" => channel_id, "token_id" => token_id,
              "policy" => policy.uri(), "mode" => ?request.security_mode);
        let listener = self.listener.expect("server connection without listener");
        ctx.events.push_back(Event::EndpointConnected {
            listener,
            connection: self.handle,
        });
        if let Some(reverse_client) = self.reverse_client {
            // Keep a spare reverse connection available for the next client
            ctx.internal.push_back(InternalEvent::ReverseConnected {
                listener,
                reverse_client,
            });
        }
        Ok(())
    }

    fn server_renew(
        &mut self,
        ctx: &mut Context,
        now: u64,
        request: OpenChannelRequest,
        request_id: u32,
        siblings: &[(u32, u32)],
    ) -> Result<(), StatusCode> {
        let (signed, policy, mode) = {
            let crypto = self.crypto.as_ref().expect("renew without crypto");
            (crypto.is_signed(), crypto.policy(), crypto.mode())
        };
        if request.security_mode != mode {
            return Err(StatusCode::BAD_SECURITY_MODE_REJECTED);
        }
        let client_nonce = if signed {
            let nonce = request
                .client_nonce
                .as_ref()
                .ok_or(StatusCode::BAD_NONCE_INVALID)?;
            if nonce.len() != policy.nonce_length() {
                return Err(StatusCode::BAD_NONCE_INVALID);
            }
            nonce.to_vec()
        } else {
            Vec::new()
        };

        let channel_id = self
            .current_token
            .as_ref()
            .expect("renew without current token")
            .secure_channel_id;
        let token_id = fresh_token_id(ctx, siblings)?;
        let revised_lifetime_ms = revise_lifetime(&ctx.config, request.requested_lifetime_ms);
        let token = SecurityToken {
            secure_channel_id: channel_id,
            token_id,
            created_at: now as i64,
            revised_lifetime_ms,
            lifetime_end: now + u64::from(revised_lifetime_ms),
        };
        let (keys, server_nonce) = self.server_derive(ctx, &client_nonce);
        self.install_token(token, keys);
        // Keep sending under the precedent token until the client uses the
        // new one
        self.server_new_token_active = false;
        self.send_open_channel_response(ctx, now, &request, request_id, server_nonce)?;
        self.state = State::ScConnected;
        trace!(self.log, "token renewed"; "token_id" => token_id);
        Ok(())
    }

    fn server_derive(
        &mut self,
        ctx: &mut Context,
        client_nonce: &[u8],
    ) -> (Option<KeySets>, Option<Bytes>) {
        let crypto = self.crypto.as_ref().expect("derive without crypto");
        if !crypto.is_signed() {
            return (None, None);
        }
        let server_nonce = crypto.generate_nonce(&mut ctx.rng);
        let keys = crypto.derive_server_key_sets(client_nonce, &server_nonce);
        (Some(keys), Some(Bytes::from(&server_nonce[..])))
    }

    fn send_open_channel_response(
        &mut self,
        ctx: &mut Context,
        now: u64,
        request: &OpenChannelRequest,
        request_id: u32,
        server_nonce: Option<Bytes>,
    ) -> Result<(), StatusCode> {
        let response = {
            let token = self
                .current_token
                .as_ref()
                .expect("response without installed token");
            OpenChannelResponse {
                header: ResponseHeader {
                    timestamp: now as i64,
                    request_handle: request.header.request_handle,
                    service_result: StatusCode::GOOD,
                },
                server_protocol_version: self.tcp.protocol_version,
                channel_id: token.secure_channel_id,
                token_id: token.token_id,
                created_at: token.created_at,
                revised_lifetime_ms: token.revised_lifetime_ms,
                server_nonce,
            }
        };
        let mut body = Vec::new();
        coding::Codec::encode(&response, &mut body);
        self.send_open_channel(ctx, now, body.into(), request_id)
    }

    // ---- token bookkeeping -------------------------------------------

    fn install_token(&mut self, token: SecurityToken, keys: Option<KeySets>) {
        self.precedent_token = self.current_token.take();
        self.precedent_keys = self.current_keys.take();
        self.current_token = Some(token);
        self.current_keys = keys;
    }

    // ---- service-facing operations -----------------------------------

    pub(crate) fn send_service_message(
        &mut self,
        ctx: &mut Context,
        now: u64,
        body: Bytes,
        request_id_or_handle: u32,
    ) {
        if !self.state.is_connected() {
            ctx.events.push_back(Event::SendFailure {
                connection: self.handle,
                request_handle: request_id_or_handle,
                status: StatusCode::BAD_SECURE_CHANNEL_CLOSED,
            });
            return;
        }
        match self.send_symmetric(ctx, now, MessageType::Message, body, request_id_or_handle) {
            Ok(()) => {}
            Err(SendFailed::Reported(status)) => {
                // An abort chunk went out; the channel survives
                if self.side.is_client() {
                    ctx.events.push_back(Event::SendFailure {
                        connection: self.handle,
                        request_handle: request_id_or_handle,
                        status,
                    });
                } else {
                    debug!(self.log, "failed to send response"; "status" => status,
                           "request_id" => request_id_or_handle);
                }
            }
            Err(SendFailed::Fatal(status)) => {
                if self.side.is_client() {
                    ctx.events.push_back(Event::SendFailure {
                        connection: self.handle,
                        request_handle: request_id_or_handle,
                        status,
                    });
                }
                self.close(ctx, now, status, CloseNotify::Notify);
            }
        }
    }

    pub(crate) fn send_service_error(
        &mut self,
        ctx: &mut Context,
        now: u64,
        status: StatusCode,
        request_id: u32,
    ) {
        if !self.state.is_connected() {
            return;
        }
        if let Err(err) = self.send_abort_chunk(ctx, now, status, request_id) {
            debug!(self.log, "failed to send abort"; "status" => err);
            self.close(ctx, now, err, CloseNotify::Notify);
        }
    }

    pub(crate) fn disconnect(&mut self, ctx: &mut Context, now: u64) {
        if self.state == State::Closed {
            return;
        }
        if self.state.is_connected() && self.side.is_client() {
            let close = CloseChannelRequest {
                header: RequestHeader {
                    timestamp: now as i64,
                    request_handle: 0,
                    timeout_hint: 0,
                },
            };
            let mut body = Vec::new();
            coding::Codec::encode(&close, &mut body);
            // CLO expects no response; failure to send it does not block
            // the teardown
            if let Err(status) =
                self.send_symmetric(ctx, now, MessageType::CloseChannel, body.into(), 0)
            {
                debug!(self.log, "failed to send CLO"; "status" => ?status);
            }
            self.close(
                ctx,
                now,
                StatusCode::BAD_SECURE_CHANNEL_CLOSED,
                CloseNotify::PeerNotified,
            );
        } else {
            self.close(
                ctx,
                now,
                StatusCode::BAD_SECURE_CHANNEL_CLOSED,
                CloseNotify::Notify,
            );
        }
    }

    pub(crate) fn on_close_channel(&mut self, ctx: &mut Context, now: u64) {
        trace!(self.log, "received CLO");
        // A CLO is never answered
        self.close(
            ctx,
            now,
            StatusCode::BAD_SECURE_CHANNEL_CLOSED,
            CloseNotify::PeerNotified,
        );
    }

    /// A chunk failed decoding or validation (spec §4.1 receive rule 4).
    pub(crate) fn on_receive_failure(&mut self, ctx: &mut Context, now: u64, status: StatusCode) {
        debug!(self.log, "receive failure"; "status" => status);
        self.close(ctx, now, status, CloseNotify::Notify);
    }

    // ---- teardown ----------------------------------------------------

    pub(crate) fn close(
        &mut self,
        ctx: &mut Context,
        now: u64,
        status: StatusCode,
        notify: CloseNotify,
    ) {
        let _ = now;
        if self.state == State::Closed {
            return;
        }
        let was_connected = self.state.is_connected();
        if notify == CloseNotify::Notify && self.socket.is_some() && self.side.is_server() {
            if was_connected {
                // Suppress any detail that could leak the failure cause
                let (error, reason) = if status == StatusCode::BAD_SECURITY_CHECKS_FAILED {
                    (status, None)
                } else {
                    (status.tcp_error(), Some(format!("{}", status)))
                };
                self.send_plain(ctx, MessageType::Error, &ErrorMessage { error, reason });
            } else if self.state == State::ScInit {
                // OPN-phase failures are normalized so an attacker cannot
                // distinguish certificate from policy errors
                self.send_plain(
                    ctx,
                    MessageType::Error,
                    &ErrorMessage {
                        error: StatusCode::BAD_SECURITY_CHECKS_FAILED,
                        reason: None,
                    },
                );
            } else {
                let err = ErrorMessage {
                    error: status.tcp_error(),
                    reason: None,
                };
                self.send_plain(ctx, MessageType::Error, &err);
            }
        }
        if let Some(socket) = self.socket.take() {
            ctx.io.push_back(Io::CloseSocket { socket });
        }
        self.cancel_establish_timer(ctx);
        self.cancel_renew_timer(ctx);
        for (request_id, entry) in self.sent_requests.drain() {
            if entry.timer_armed {
                ctx.io.push_back(Io::TimerStop {
                    timer: Timer::Request(self.handle, request_id),
                });
            }
            if entry.msg_type == MessageType::Message {
                ctx.events.push_back(Event::SendFailure {
                    connection: self.handle,
                    request_handle: entry.request_handle,
                    status: StatusCode::BAD_SECURE_CHANNEL_CLOSED,
                });
            }
        }
        self.chunks.clear();
        self.crypto = None;
        self.current_token = None;
        self.precedent_token = None;
        self.current_keys = None;
        self.precedent_keys = None;
        self.peer_identity = None;
        self.client_nonce = None;
        let prev_state = self.state;
        self.state = State::Closed;

        if notify == CloseNotify::Timeout {
            // Only clients announced this connection to the services layer
            // before establishment
            if self.side.is_client() && self.channel_config.is_some() {
                ctx.events.push_back(Event::ConnectionTimeout {
                    connection: self.handle,
                });
            }
        } else if was_connected {
            self.disconnect_notified = true;
            ctx.events.push_back(Event::Disconnected {
                connection: self.handle,
                status,
            });
        } else if self.side.is_client() && self.channel_config.is_some() {
            // Establishment failed before the channel came up
            ctx.events.push_back(Event::ConnectionTimeout {
                connection: self.handle,
            });
        }
        if let Some(listener) = self.listener {
            ctx.internal.push_back(InternalEvent::ScDisconnected {
                listener,
                connection: self.handle,
                reverse_client: self.reverse_client,
            });
        }
        trace!(self.log, "closed"; "status" => status, "state" => ?prev_state);
    }

    pub(crate) fn close_immediate(&mut self, ctx: &mut Context, now: u64, status: StatusCode) {
        // Socket already failed or nothing established yet: no wire notice
        self.close(ctx, now, status, CloseNotify::PeerNotified);
    }
}

/// How a closure is carried out and reported.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum CloseNotify {
    /// Notify the peer on the wire when possible, then raise events.
    Notify,
    /// The peer already knows (CLO/ERR exchanged or socket gone).
    PeerNotified,
    /// Raised by the establishment timer.
    Timeout,
}

/// Outcome of a failed symmetric send.
#[derive(Debug)]
pub(crate) enum SendFailed {
    /// An abort chunk was emitted; the channel stays open.
    Reported(StatusCode),
    /// Nothing could be salvaged; the channel must close.
    Fatal(StatusCode),
}

fn negotiate_buffer(own: u32, peer: u32) -> Result<u32, StatusCode> {
    if peer < MIN_BUFFER_SIZE {
        return Err(StatusCode::BAD_INVALID_ARGUMENT);
    }
    Ok(own.min(peer))
}

/// Merge a peer-announced limit with ours; 0 means unlimited.
fn negotiate_limit(own: u32, peer: u32) -> u32 {
    if peer != 0 && (own == 0 || peer < own) {
        peer
    } else {
        own
    }
}

fn revise_lifetime(config: &Config, requested_ms: u32) -> u32 {
    requested_ms
        .max(config.min_token_lifetime_ms)
        .min(config.max_token_lifetime_ms)
}

/// Draw a fresh non-zero `(secureChannelId, tokenId)` pair avoiding every
/// live sibling on the listener, in at most 5 CSPRNG attempts (Part 6
/// Table 26 requires unpredictable ids).
fn fresh_channel_and_token_ids(
    ctx: &mut Context,
    siblings: &[(u32, u32)],
) -> Result<(u32, u32), StatusCode> {
    use rand::RngCore;
    let mut channel_id = 0;
    let mut token_id = 0;
    for _ in 0..5 {
        if channel_id == 0 {
            let id = ctx.rng.next_u32();
            if id != 0 && siblings.iter().all(|&(c, _)| c != id) {
                channel_id = id;
            }
        }
        if token_id == 0 {
            let id = ctx.rng.next_u32();
            if id != 0 && siblings.iter().all(|&(_, t)| t != id) {
                token_id = id;
            }
        }
        if channel_id != 0 && token_id != 0 {
            return Ok((channel_id, token_id));
        }
    }
    Err(StatusCode::BAD_TCP_INTERNAL_ERROR)
}

fn fresh_token_id(ctx: &mut Context, siblings: &[(u32, u32)]) -> Result<u32, StatusCode> {
    use rand::RngCore;
    for _ in 0..5 {
        let id = ctx.rng.next_u32();
        if id != 0 && siblings.iter().all(|&(_, t)| t != id) {
            return Ok(id);
        }
    }
    Err(StatusCode::BAD_TCP_INTERNAL_ERROR)
}
