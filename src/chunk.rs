//! Chunk manager: framing, cryptographic transforms and reassembly of
//! secure-channel message chunks (Part 6 §6.7).

use std::io::Cursor;

use bytes::{Buf, Bytes, BytesMut};
use constant_time_eq::constant_time_eq;

use coding::{BufExt, BufMutExt, Codec};
use connection::{Connection, SendFailed, SentRequest, State};
use crypto::{self, KeySet};
use endpoint::{Context, Event, Io, Timer};
use message::{
    Acknowledge, AsymmetricHeader, ChunkEnd, ErrorMessage, Hello, MessageType, OpenChannelRequest,
    OpenChannelResponse, ReverseHello, SequenceHeader, TcpHeader,
};
use {
    SecurityMode, Side, StatusCode, MAX_URL_AND_REASON_LENGTH, SEQUENCE_HEADER_SIZE,
    SEQUENCE_WRAP_WINDOW, SYMMETRIC_HEADER_SIZE, TCP_HEADER_SIZE,
};

/// Per-connection chunk accumulation and reassembly state.
pub struct ChunkCtx {
    /// Raw bytes received from the socket, not yet framed.
    incoming: BytesMut,
    /// Header of the chunk currently being accumulated.
    current_header: Option<TcpHeader>,
    /// Decrypted and stripped bodies of the intermediate chunks of the
    /// message under reassembly.
    intermediate: Vec<Bytes>,
    intermediate_total: usize,
    /// Request id shared by every chunk of the message under reassembly.
    request_id: Option<u32>,
    /// The response being reassembled answers an expired request and must
    /// be discarded silently once complete.
    drop_message: bool,
}

impl ChunkCtx {
    pub(crate) fn new() -> ChunkCtx {
        ChunkCtx {
            incoming: BytesMut::new(),
            current_header: None,
            intermediate: Vec::new(),
            intermediate_total: 0,
            request_id: None,
            drop_message: false,
        }
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        self.incoming.extend_from_slice(data);
    }

    /// Extract the next complete chunk, validating its common header
    /// against the negotiated receive buffer size.
    fn next_chunk(
        &mut self,
        receive_buffer_size: u32,
    ) -> Result<Option<(TcpHeader, Bytes)>, StatusCode> {
        if self.current_header.is_none() {
            if self.incoming.len() < TCP_HEADER_SIZE {
                return Ok(None);
            }
            let mut raw = [0; TCP_HEADER_SIZE];
            raw.copy_from_slice(&self.incoming[..TCP_HEADER_SIZE]);
            let header = TcpHeader::decode(&raw)?;
            if header.size > receive_buffer_size {
                return Err(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
            }
            self.current_header = Some(header);
        }
        let header = self.current_header.unwrap();
        if self.incoming.len() < header.size as usize {
            return Ok(None);
        }
        let chunk = self.incoming.split_to(header.size as usize).freeze();
        self.current_header = None;
        Ok(Some((header, chunk)))
    }

    /// Discard the message under reassembly, keeping buffered raw bytes.
    fn clear_message(&mut self) {
        self.intermediate.clear();
        self.intermediate_total = 0;
        self.request_id = None;
        self.drop_message = false;
    }

    pub(crate) fn clear(&mut self) {
        self.clear_message();
        self.incoming.clear();
        self.current_header = None;
    }
}

/// Whether a second padding-size byte is needed: padding can exceed 255
/// bytes whenever a plaintext block is larger than 256 bytes.
fn has_extra_padding(plain_block: usize) -> bool {
    plain_block > 256
}

/// Maximum chunk body for the given framing, from the errata formula:
/// `PlainBlock * floor((ChunkSize - Headers) / CipherBlock)
///  - SequenceHeader - Signature - PaddingFields`.
fn compute_max_body_size(
    non_encrypted_headers: usize,
    chunk_size: usize,
    to_encrypt: bool,
    cipher_block: usize,
    plain_block: usize,
    to_sign: bool,
    signature_size: usize,
) -> Result<usize, StatusCode> {
    let (cipher_block, plain_block, padding_fields) = if to_encrypt {
        let fields = 1 + has_extra_padding(plain_block) as usize;
        (cipher_block, plain_block, fields)
    } else {
        (1, 1, 0)
    };
    let signature_size = if to_sign { signature_size } else { 0 };
    if cipher_block < plain_block || plain_block == 0 || chunk_size <= non_encrypted_headers {
        return Err(StatusCode::BAD_TCP_INTERNAL_ERROR);
    }
    (plain_block * ((chunk_size - non_encrypted_headers) / cipher_block))
        .checked_sub(SEQUENCE_HEADER_SIZE + signature_size + padding_fields)
        .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)
}

/// Padding needed so the region to encrypt fills whole plaintext blocks.
fn compute_padding_size(bytes_to_encrypt: usize, plain_block: usize, signature_size: usize) -> usize {
    let fields = 1 + has_extra_padding(plain_block) as usize;
    let missing = (bytes_to_encrypt + signature_size + fields) % plain_block;
    if missing == 0 {
        0
    } else {
        plain_block - missing
    }
}

/// Strip padding fields from the tail of a decrypted region.
fn strip_padding(data: &mut Vec<u8>, plain_block: usize) -> Result<(), StatusCode> {
    let mut padding = 0;
    if has_extra_padding(plain_block) {
        let msb = *data.last().ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
        data.pop();
        padding = usize::from(msb) << 8;
    }
    let lsb = *data.last().ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
    padding += usize::from(lsb) + 1; // the padding-size byte itself
    if padding > data.len() {
        return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
    }
    let new_len = data.len() - padding;
    data.truncate(new_len);
    Ok(())
}

fn write_padding(buf: &mut Vec<u8>, padding: usize, plain_block: usize) {
    let lsb = (padding & 0xFF) as u8;
    buf.push(lsb);
    buf.extend(::std::iter::repeat(lsb).take(padding));
    if has_extra_padding(plain_block) {
        buf.push((padding >> 8) as u8);
    }
}

/// Patch the `MessageSize` field of an encoded chunk.
fn set_message_size(buf: &mut [u8], size: usize) {
    debug_assert!(size <= u32::max_value() as usize);
    let size = size as u32;
    buf[4] = size as u8;
    buf[5] = (size >> 8) as u8;
    buf[6] = (size >> 16) as u8;
    buf[7] = (size >> 24) as u8;
}

/// Cryptographic parameters of one sending direction.
struct SendingCrypto {
    to_encrypt: bool,
    to_sign: bool,
    cipher_block: usize,
    plain_block: usize,
    signature_size: usize,
}

/// Result of decoding the secured prefix of an inbound chunk.
struct DecodedChunk {
    sequence: SequenceHeader,
    /// For a client, the request handle recorded when the request was sent;
    /// for a server, the request id to echo in the response.
    request_id_or_handle: u32,
    /// The matching request expired; discard silently once reassembled.
    timeout_expired: bool,
    body: Bytes,
}

impl Connection {
    // ---- receive pipeline --------------------------------------------

    /// Feed raw socket bytes through the chunk manager.
    ///
    /// Returns a decoded RHE when one arrives, so the endpoint can match it
    /// against a pending reverse-connect request and resume processing;
    /// `siblings` is the live `(channelId, tokenId)` table of the owning
    /// listener (server connections only).
    pub(crate) fn handle_data(
        &mut self,
        ctx: &mut Context,
        now: u64,
        data: &[u8],
        siblings: &[(u32, u32)],
    ) -> Option<ReverseHello> {
        self.chunks.push(data);
        while self.state != State::Closed {
            let (header, raw) = match self.chunks.next_chunk(self.tcp.receive_buffer_size) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(status) => {
                    self.on_receive_failure(ctx, now, status);
                    break;
                }
            };
            trace!(self.log(), "got chunk"; "type" => ?header.message_type,
                   "end" => ?header.end, "size" => header.size);
            if header.message_type == MessageType::ReverseHello {
                let mut buf = Cursor::new(&raw[TCP_HEADER_SIZE..]);
                match ReverseHello::decode(&mut buf) {
                    Ok(rhe) => return Some(rhe),
                    Err(e) => {
                        self.on_receive_failure(ctx, now, e.into());
                        break;
                    }
                }
            }
            if let Err(status) = self.process_chunk(ctx, now, header, raw, siblings) {
                self.on_receive_failure(ctx, now, status);
                break;
            }
        }
        None
    }

    fn process_chunk(
        &mut self,
        ctx: &mut Context,
        now: u64,
        header: TcpHeader,
        raw: Bytes,
        siblings: &[(u32, u32)],
    ) -> Result<(), StatusCode> {
        let mut buf = Cursor::new(&raw[TCP_HEADER_SIZE..]);
        match header.message_type {
            MessageType::Hello => {
                let hello = Hello::decode(&mut buf)?;
                self.on_hello(ctx, hello)
            }
            MessageType::Acknowledge => {
                let ack = Acknowledge::decode(&mut buf)?;
                self.on_acknowledge(ctx, now, ack)
            }
            MessageType::Error => {
                let err = ErrorMessage::decode(&mut buf)?;
                self.on_error_message(ctx, now, err);
                Ok(())
            }
            MessageType::ReverseHello => unreachable!("handled by the endpoint"),
            MessageType::OpenChannel => self.process_open_channel_chunk(ctx, now, raw, siblings),
            MessageType::CloseChannel | MessageType::Message => {
                self.process_symmetric_chunk(ctx, now, header, raw)
            }
        }
    }

    fn process_open_channel_chunk(
        &mut self,
        ctx: &mut Context,
        now: u64,
        raw: Bytes,
        siblings: &[(u32, u32)],
    ) -> Result<(), StatusCode> {
        let (channel_id, asym, prefix) = {
            let mut buf = Cursor::new(&raw[..]);
            buf.advance(TCP_HEADER_SIZE);
            let channel_id = buf.get::<u32>()?;
            let asym = AsymmetricHeader::decode(&mut buf)?;
            (channel_id, asym, buf.position() as usize)
        };
        let secured = self.validate_asymmetric_header(channel_id, &asym)?;

        // Decrypt with the local private key, then verify with the peer's
        // public key over the whole plaintext chunk
        let mut plain = raw[..prefix].to_vec();
        if secured {
            let key_pair = self.own_key_pair()?;
            let cipher = &raw[prefix..];
            if cipher.is_empty() || cipher.len() % key_pair.cipher_block_size() != 0 {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            plain.extend_from_slice(&key_pair.decrypt(cipher)?);
        } else {
            plain.extend_from_slice(&raw[prefix..]);
        }
        if secured {
            let identity = self
                .peer_identity
                .as_ref()
                .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            let signature_size = identity.signature_size();
            if plain.len() < prefix + SEQUENCE_HEADER_SIZE + signature_size {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            let split = plain.len() - signature_size;
            identity.verify(&plain[..split], &plain[split..])?;
            plain.truncate(split);
        }

        let sequence = {
            let mut buf = Cursor::new(&plain[prefix..]);
            SequenceHeader::decode(&mut buf)?
        };
        // An OPN resets the receive sequence number unconditionally
        self.last_sn_received = sequence.sequence_number;

        let mut timeout_expired = false;
        if self.side.is_client() {
            let entry = self
                .sent_requests
                .remove(&sequence.request_id)
                .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            if entry.timer_armed {
                ctx.io.push_back(Io::TimerStop {
                    timer: Timer::Request(self.handle, sequence.request_id),
                });
            }
            if entry.msg_type != MessageType::OpenChannel {
                self.sent_requests.insert(sequence.request_id, entry);
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            timeout_expired = entry.timeout_expired;
        }

        if secured {
            let plain_block = self.own_key_pair()?.plain_block_size();
            strip_padding(&mut plain, plain_block)?;
            if plain.len() < prefix + SEQUENCE_HEADER_SIZE {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
        }
        if timeout_expired {
            debug!(self.log(), "dropping OPN response to expired request";
                   "request_id" => sequence.request_id);
            return Ok(());
        }

        let mut body = Cursor::new(&plain[prefix + SEQUENCE_HEADER_SIZE..]);
        if self.side.is_server() {
            let request = OpenChannelRequest::decode(&mut body)?;
            self.on_open_channel_request(ctx, now, request, sequence.request_id, siblings)
        } else {
            let response = OpenChannelResponse::decode(&mut body)?;
            self.on_open_channel_response(ctx, now, response, channel_id)
        }
    }

    /// Validate the asymmetric security header (spec §4.1.1) and prepare
    /// the peer identity. Returns whether the chunk is signed & encrypted.
    fn validate_asymmetric_header(
        &mut self,
        channel_id: u32,
        asym: &AsymmetricHeader,
    ) -> Result<bool, StatusCode> {
        let policy = crypto::SecurityPolicy::from_uri(&asym.policy_uri)
            .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?;
        // OPN chunks are fully secured or not at all; mixed presence of the
        // two certificate fields is malformed
        let secured = match (&asym.sender_certificate, &asym.receiver_thumbprint) {
            (&Some(_), &Some(_)) => true,
            (&None, &None) => false,
            _ => return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED),
        };
        if policy == crypto::SecurityPolicy::None && secured {
            return Err(StatusCode::BAD_CERTIFICATE_USE_NOT_ALLOWED);
        }
        if policy != crypto::SecurityPolicy::None && !secured {
            return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
        }

        match (self.side, self.state) {
            (Side::Server, State::ScInit) => {
                if channel_id != 0 {
                    return Err(StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN);
                }
                let config = self
                    .endpoint_config
                    .clone()
                    .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
                let accepted = config
                    .policies
                    .iter()
                    .find(|&&(p, _)| p == policy)
                    .map(|&(_, modes)| modes)
                    .ok_or(StatusCode::BAD_SECURITY_POLICY_REJECTED)?;
                if secured {
                    let sender = asym.sender_certificate.as_ref().unwrap();
                    let pki = config
                        .pki
                        .as_ref()
                        .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
                    pki.validate(sender, policy)?;
                    self.peer_identity = Some(pki.peer_identity(sender)?);
                    self.peer_certificate = Some(sender.clone());
                    self.check_receiver_thumbprint(
                        asym,
                        config.own_certificate.as_ref().map(|c| &c[..]),
                    )?;
                }
                self.pending_policy = Some(policy);
                self.accepted_modes = Some(accepted);
                Ok(secured)
            }
            (Side::Server, State::ScConnected) => {
                // Renewal must keep the established policy and security
                let crypto = self
                    .crypto
                    .as_ref()
                    .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
                if policy != crypto.policy() {
                    return Err(StatusCode::BAD_SECURITY_POLICY_REJECTED);
                }
                let established_secured = crypto.mode() != SecurityMode::None;
                if secured != established_secured {
                    return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
                }
                let current_channel = self
                    .current_token
                    .as_ref()
                    .map_or(0, |t| t.secure_channel_id);
                if channel_id != current_channel {
                    return Err(StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN);
                }
                if secured {
                    let sender = asym.sender_certificate.as_ref().unwrap();
                    let recorded = self
                        .peer_certificate
                        .as_ref()
                        .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
                    if !constant_time_eq(sender, recorded) {
                        return Err(StatusCode::BAD_CERTIFICATE_INVALID);
                    }
                    let own = self
                        .endpoint_config
                        .as_ref()
                        .and_then(|c| c.own_certificate.as_ref())
                        .map(|c| c.clone());
                    self.check_receiver_thumbprint(asym, own.as_ref().map(|c| &c[..]))?;
                }
                Ok(secured)
            }
            (Side::Client, State::ScConnecting) | (Side::Client, State::ScConnectedRenew) => {
                let config = self
                    .channel_config
                    .clone()
                    .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
                if policy != config.policy {
                    return Err(StatusCode::BAD_SECURITY_POLICY_REJECTED);
                }
                let expected_secured = config.mode != SecurityMode::None;
                if secured != expected_secured {
                    return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
                }
                if secured {
                    let sender = asym.sender_certificate.as_ref().unwrap();
                    let expected = config
                        .peer_certificate
                        .as_ref()
                        .ok_or(StatusCode::BAD_CERTIFICATE_INVALID)?;
                    if !constant_time_eq(sender, expected) {
                        return Err(StatusCode::BAD_CERTIFICATE_INVALID);
                    }
                    self.check_receiver_thumbprint(
                        asym,
                        config.own_certificate.as_ref().map(|c| &c[..]),
                    )?;
                }
                Ok(secured)
            }
            _ => Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID),
        }
    }

    fn check_receiver_thumbprint(
        &self,
        asym: &AsymmetricHeader,
        own_certificate: Option<&[u8]>,
    ) -> Result<(), StatusCode> {
        let thumbprint = asym
            .receiver_thumbprint
            .as_ref()
            .ok_or(StatusCode::BAD_CERTIFICATE_INVALID)?;
        let own = own_certificate.ok_or(StatusCode::BAD_CERTIFICATE_INVALID)?;
        if !constant_time_eq(thumbprint, &crypto::thumbprint(own)) {
            return Err(StatusCode::BAD_CERTIFICATE_INVALID);
        }
        Ok(())
    }

    fn process_symmetric_chunk(
        &mut self,
        ctx: &mut Context,
        now: u64,
        header: TcpHeader,
        raw: Bytes,
    ) -> Result<(), StatusCode> {
        if !self.state.is_connected() {
            return Err(StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN);
        }
        if header.message_type == MessageType::CloseChannel && !self.side.is_server() {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }
        let decoded = match self.decode_symmetric_chunk(ctx, now, &header, raw)? {
            Some(decoded) => decoded,
            // Response to an expired request, already discarded
            None => return Ok(()),
        };
        match header.message_type {
            MessageType::CloseChannel => {
                self.on_close_channel(ctx, now);
                Ok(())
            }
            MessageType::Message => self.reassemble(ctx, header.end, decoded),
            _ => unreachable!(),
        }
    }

    fn decode_symmetric_chunk(
        &mut self,
        ctx: &mut Context,
        now: u64,
        header: &TcpHeader,
        raw: Bytes,
    ) -> Result<Option<DecodedChunk>, StatusCode> {
        const PREFIX: usize = TCP_HEADER_SIZE + 4 + SYMMETRIC_HEADER_SIZE;
        let (channel_id, token_id) = {
            let mut buf = Cursor::new(&raw[TCP_HEADER_SIZE..]);
            (buf.get::<u32>()?, buf.get::<u32>()?)
        };
        let current_channel = self
            .current_token
            .as_ref()
            .map_or(0, |t| t.secure_channel_id);
        if channel_id != current_channel {
            return Err(StatusCode::BAD_TCP_SECURE_CHANNEL_UNKNOWN);
        }
        let precedent = self.select_receive_token(token_id, now)?;

        let (encrypted, signed, signature_size, plain_block) = {
            let crypto = self
                .crypto
                .as_ref()
                .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
            (
                crypto.is_encrypted(false),
                crypto.is_signed(),
                crypto.policy().symmetric_signature_size(),
                crypto.policy().symmetric_block_size(),
            )
        };

        let mut plain = raw[..PREFIX].to_vec();
        if encrypted {
            let cipher = &raw[PREFIX..];
            let keys = self.receive_keys(precedent)?;
            let crypto = self.crypto.as_ref().unwrap();
            plain.extend_from_slice(&crypto.symmetric_decrypt(&keys.receiver, cipher)?);
        } else {
            plain.extend_from_slice(&raw[PREFIX..]);
        }
        if signed {
            if plain.len() < PREFIX + SEQUENCE_HEADER_SIZE + signature_size {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            let split = plain.len() - signature_size;
            {
                let keys = self.receive_keys(precedent)?;
                let crypto = self.crypto.as_ref().unwrap();
                crypto.symmetric_verify(&keys.receiver, &plain[..split], &plain[split..])?;
            }
            plain.truncate(split);
        }

        let sequence = {
            let mut buf = Cursor::new(&plain[PREFIX..]);
            SequenceHeader::decode(&mut buf)?
        };
        self.check_sequence_number(sequence.sequence_number)?;

        // All chunks of one message carry the same request id
        if let Some(expected) = self.chunks.request_id {
            if sequence.request_id != expected {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
        }

        let mut request_id_or_handle = sequence.request_id;
        let mut timeout_expired = self.chunks.drop_message;
        if self.side.is_client() && header.message_type == MessageType::Message {
            let entry = self
                .sent_requests
                .remove(&sequence.request_id)
                .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            if entry.msg_type != MessageType::Message {
                // Re-register so teardown still reports the pending request
                self.sent_requests.insert(sequence.request_id, entry);
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            timeout_expired |= entry.timeout_expired;
            if header.end == ChunkEnd::Intermediate {
                // Keep the slot and its timer armed until the final chunk
                self.sent_requests.insert(sequence.request_id, entry);
            } else {
                if entry.timer_armed {
                    ctx.io.push_back(Io::TimerStop {
                        timer: Timer::Request(self.handle, sequence.request_id),
                    });
                }
                request_id_or_handle = entry.request_handle;
            }
        }

        if encrypted {
            strip_padding(&mut plain, plain_block)?;
            if plain.len() < PREFIX + SEQUENCE_HEADER_SIZE {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
        }
        let body = Bytes::from(&plain[PREFIX + SEQUENCE_HEADER_SIZE..]);
        Ok(Some(DecodedChunk {
            sequence,
            request_id_or_handle,
            timeout_expired,
            body,
        }))
    }

    /// Select the inbound token and remember first use of a renewed one
    /// (spec §4.1.2). Returns whether the precedent crypto applies.
    fn select_receive_token(&mut self, token_id: u32, now: u64) -> Result<bool, StatusCode> {
        let side = self.side;
        if let Some(ref current) = self.current_token {
            if current.token_id == token_id {
                if side.is_server() && !self.server_new_token_active {
                    // First message under the new token: the precedent one
                    // is dead from here on
                    self.server_new_token_active = true;
                }
                if current.is_valid(side, now) {
                    return Ok(false);
                }
                return Err(StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN);
            }
        }
        if let Some(ref precedent) = self.precedent_token {
            if precedent.token_id == token_id
                && precedent.token_id != 0
                && precedent.secure_channel_id != 0
                && !(side.is_server() && self.server_new_token_active)
                && precedent.is_valid(side, now)
            {
                return Ok(true);
            }
        }
        Err(StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN)
    }

    fn receive_keys(&self, precedent: bool) -> Result<&::crypto::KeySets, StatusCode> {
        let keys = if precedent {
            self.precedent_keys.as_ref()
        } else {
            self.current_keys.as_ref()
        };
        keys.ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)
    }

    /// Sequence numbers increase by one, wrapping only from within 1024 of
    /// the maximum to a value below 1024 (Part 6 §6.7.2).
    fn check_sequence_number(&mut self, sn: u32) -> Result<(), StatusCode> {
        if self.last_sn_received.wrapping_add(1) == sn {
            self.last_sn_received = sn;
            return Ok(());
        }
        if self.last_sn_received > u32::max_value() - SEQUENCE_WRAP_WINDOW
            && sn < SEQUENCE_WRAP_WINDOW
        {
            self.last_sn_received = sn;
            return Ok(());
        }
        debug!(self.log(), "sequence number mismatch";
               "expected" => self.last_sn_received.wrapping_add(1), "got" => sn);
        Err(StatusCode::BAD_SECURITY_CHECKS_FAILED)
    }

    /// Multi-chunk reassembly (spec §4.1.4).
    fn reassemble(
        &mut self,
        ctx: &mut Context,
        end: ChunkEnd,
        decoded: DecodedChunk,
    ) -> Result<(), StatusCode> {
        let max_size = self.tcp.receive_max_message_size as usize;
        match end {
            ChunkEnd::Intermediate => {
                let max_chunks = self.tcp.receive_max_chunk_count as usize;
                if max_chunks != 0 && self.chunks.intermediate.len() + 1 >= max_chunks {
                    return Err(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
                }
                if max_size != 0 && self.chunks.intermediate_total + decoded.body.len() > max_size {
                    return Err(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
                }
                self.chunks.intermediate_total += decoded.body.len();
                self.chunks.intermediate.push(decoded.body);
                self.chunks.request_id = Some(decoded.sequence.request_id);
                self.chunks.drop_message = decoded.timeout_expired;
                Ok(())
            }
            ChunkEnd::Abort => {
                let abort = {
                    let mut buf = Cursor::new(&decoded.body[..]);
                    ErrorMessage::decode(&mut buf)?
                };
                let expired = self.chunks.drop_message || decoded.timeout_expired;
                self.chunks.clear_message();
                if self.side.is_client() {
                    if !expired {
                        // The outcome of the aborted request goes back to
                        // the caller; the channel itself stays up
                        ctx.events.push_back(Event::SendFailure {
                            connection: self.handle,
                            request_handle: decoded.request_id_or_handle,
                            status: abort.error,
                        });
                    }
                } else {
                    debug!(self.log(), "peer aborted message"; "status" => abort.error,
                           "reason" => abort.reason.as_ref().map_or("", |s| &s[..]));
                }
                Ok(())
            }
            ChunkEnd::Final => {
                if max_size != 0 && self.chunks.intermediate_total + decoded.body.len() > max_size {
                    return Err(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
                }
                let expired = self.chunks.drop_message || decoded.timeout_expired;
                let body = if self.chunks.intermediate.is_empty() {
                    decoded.body
                } else {
                    let mut message =
                        Vec::with_capacity(self.chunks.intermediate_total + decoded.body.len());
                    for chunk in &self.chunks.intermediate {
                        message.extend_from_slice(chunk);
                    }
                    message.extend_from_slice(&decoded.body);
                    Bytes::from(message)
                };
                self.chunks.clear_message();
                if expired {
                    debug!(self.log(), "dropping response to expired request";
                           "request_id" => decoded.sequence.request_id);
                    return Ok(());
                }
                ctx.events.push_back(Event::ReceivedMessage {
                    connection: self.handle,
                    request_id: decoded.request_id_or_handle,
                    body,
                });
                Ok(())
            }
        }
    }

    // ---- send pipeline -----------------------------------------------

    /// Encode and transmit an unsecured message (HEL/ACK/ERR/RHE).
    pub(crate) fn send_plain<T: Codec>(&mut self, ctx: &mut Context, msg_type: MessageType, body: &T) {
        let mut buf = Vec::new();
        TcpHeader {
            message_type: msg_type,
            end: ChunkEnd::Final,
            size: 0,
        }
        .encode(&mut buf);
        body.encode(&mut buf);
        let size = buf.len();
        set_message_size(&mut buf, size);
        self.transmit(ctx, buf);
    }

    fn transmit(&mut self, ctx: &mut Context, buf: Vec<u8>) {
        match self.socket {
            Some(socket) => ctx.io.push_back(Io::Transmit {
                socket,
                data: buf.into(),
            }),
            None => debug!(self.log(), "dropping transmit without socket"),
        }
    }

    fn own_key_pair(&self) -> Result<::std::sync::Arc<::crypto::KeyPair>, StatusCode> {
        let key_pair = match self.side {
            Side::Client => self
                .channel_config
                .as_ref()
                .and_then(|c| c.key_pair.clone()),
            Side::Server => self
                .endpoint_config
                .as_ref()
                .and_then(|c| c.key_pair.clone()),
        };
        key_pair.ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)
    }

    fn own_certificate(&self) -> Option<Bytes> {
        match self.side {
            Side::Client => self
                .channel_config
                .as_ref()
                .and_then(|c| c.own_certificate.clone()),
            Side::Server => self
                .endpoint_config
                .as_ref()
                .and_then(|c| c.own_certificate.clone()),
        }
    }

    fn peer_certificate_der(&self) -> Option<Bytes> {
        match self.side {
            Side::Client => self
                .channel_config
                .as_ref()
                .and_then(|c| c.peer_certificate.clone()),
            Side::Server => self.peer_certificate.clone(),
        }
    }

    fn asymmetric_sending_crypto(&self) -> Result<SendingCrypto, StatusCode> {
        let crypto = self
            .crypto
            .as_ref()
            .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
        if !crypto.is_signed() {
            return Ok(SendingCrypto {
                to_encrypt: false,
                to_sign: false,
                cipher_block: 1,
                plain_block: 1,
                signature_size: 0,
            });
        }
        let identity = self
            .peer_identity
            .as_ref()
            .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
        Ok(SendingCrypto {
            to_encrypt: true,
            to_sign: true,
            cipher_block: identity.cipher_block_size(),
            plain_block: identity.plain_block_size(),
            signature_size: self.own_key_pair()?.signature_size(),
        })
    }

    fn symmetric_sending_crypto(&self) -> Result<SendingCrypto, StatusCode> {
        let crypto = self
            .crypto
            .as_ref()
            .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
        let block = crypto.policy().symmetric_block_size();
        Ok(SendingCrypto {
            to_encrypt: crypto.is_encrypted(false),
            to_sign: crypto.is_signed(),
            cipher_block: block,
            plain_block: block,
            signature_size: crypto.policy().symmetric_signature_size(),
        })
    }

    /// Sending sequence numbers restart at 1 before the wrap window.
    fn next_sequence_number(&mut self) -> u32 {
        if self.last_sn_sent > u32::max_value() - SEQUENCE_WRAP_WINDOW {
            self.last_sn_sent = 1;
        } else {
            self.last_sn_sent += 1;
        }
        self.last_sn_sent
    }

    /// The request id written into a chunk; clients allocate fresh ids and
    /// advance only once the message's final chunk is encoded.
    fn chunk_request_id(&mut self, is_final: bool, request_id_or_handle: u32) -> u32 {
        if self.side.is_server() {
            return request_id_or_handle;
        }
        if self.next_request_id == 0 {
            // 0 denotes "unset" internally and is never put on the wire
            self.next_request_id = 1;
        }
        let id = self.next_request_id;
        if is_final {
            self.next_request_id = self.next_request_id.wrapping_add(1);
        }
        id
    }

    /// Encode and transmit a single-chunk OPN (spec §4.1.5 rule 3).
    pub(crate) fn send_open_channel(
        &mut self,
        ctx: &mut Context,
        now: u64,
        body: Bytes,
        request_id_or_handle: u32,
    ) -> Result<(), StatusCode> {
        let crypto_secured = self
            .crypto
            .as_ref()
            .ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?
            .is_signed();
        let asym = AsymmetricHeader {
            policy_uri: self
                .crypto
                .as_ref()
                .unwrap()
                .policy()
                .uri()
                .to_string(),
            sender_certificate: if crypto_secured {
                Some(
                    self.own_certificate()
                        .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?,
                )
            } else {
                None
            },
            receiver_thumbprint: if crypto_secured {
                let peer = self
                    .peer_certificate_der()
                    .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
                Some(Bytes::from(crypto::thumbprint(&peer)))
            } else {
                None
            },
        };
        let channel_id = match (self.side, &self.current_token) {
            // First OPN of a client: no channel assigned yet
            (Side::Client, &None) => 0,
            (_, &Some(ref token)) => token.secure_channel_id,
            (Side::Server, &None) => return Err(StatusCode::BAD_TCP_INTERNAL_ERROR),
        };

        let sizes = self.asymmetric_sending_crypto()?;
        let security_header_len = asym.encoded_len();
        let prefix = TCP_HEADER_SIZE + 4 + security_header_len;
        let max_body = compute_max_body_size(
            prefix,
            self.tcp.send_buffer_size as usize,
            sizes.to_encrypt,
            sizes.cipher_block,
            sizes.plain_block,
            sizes.to_sign,
            sizes.signature_size,
        )?;
        if body.len() > max_body {
            debug!(self.log(), "OPN body exceeds single chunk"; "len" => body.len(),
                   "max" => max_body);
            return Err(StatusCode::BAD_TCP_INTERNAL_ERROR);
        }

        let request_id = self.chunk_request_id(true, request_id_or_handle);
        let mut buf = Vec::with_capacity(prefix + body.len() + 128);
        TcpHeader {
            message_type: MessageType::OpenChannel,
            end: ChunkEnd::Final,
            size: 0,
        }
        .encode(&mut buf);
        buf.write(channel_id);
        asym.encode(&mut buf);
        SequenceHeader {
            sequence_number: self.next_sequence_number(),
            request_id,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&body);

        if sizes.to_encrypt {
            let padding =
                compute_padding_size(buf.len() - prefix, sizes.plain_block, sizes.signature_size);
            write_padding(&mut buf, padding, sizes.plain_block);
            let plain_len = buf.len() - prefix + sizes.signature_size;
            debug_assert_eq!(plain_len % sizes.plain_block, 0);
            let cipher_len = plain_len / sizes.plain_block * sizes.cipher_block;
            let total = prefix + cipher_len;
            set_message_size(&mut buf, total);
        } else {
            let total = buf.len() + if sizes.to_sign { sizes.signature_size } else { 0 };
            set_message_size(&mut buf, total);
        }
        if sizes.to_sign {
            let signature = self.own_key_pair()?.sign(&buf)?;
            if signature.len() != sizes.signature_size {
                return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
            }
            buf.extend_from_slice(&signature);
        }
        if sizes.to_encrypt {
            let identity = self
                .peer_identity
                .as_ref()
                .ok_or(StatusCode::BAD_SECURITY_CHECKS_FAILED)?;
            let cipher = identity.encrypt(&buf[prefix..])?;
            buf.truncate(prefix);
            buf.extend_from_slice(&cipher);
        }

        if self.side.is_client() {
            self.register_sent_request(
                ctx,
                now,
                request_id,
                MessageType::OpenChannel,
                request_id_or_handle,
            );
        }
        self.transmit(ctx, buf);
        Ok(())
    }

    /// Fragment, secure and transmit a MSG or CLO (spec §4.1.5 rules 4-7).
    pub(crate) fn send_symmetric(
        &mut self,
        ctx: &mut Context,
        now: u64,
        msg_type: MessageType,
        body: Bytes,
        request_id_or_handle: u32,
    ) -> Result<(), SendFailed> {
        let max_body = self
            .symmetric_max_body_size()
            .map_err(SendFailed::Fatal)?;
        let too_large = if self.side.is_client() {
            StatusCode::BAD_REQUEST_TOO_LARGE
        } else {
            StatusCode::BAD_RESPONSE_TOO_LARGE
        };
        let max_message = self.tcp.send_max_message_size as usize;
        if max_message != 0 && body.len() > max_message {
            return Err(SendFailed::Reported(too_large));
        }
        let nb_chunks = if body.is_empty() {
            1
        } else {
            (body.len() + max_body - 1) / max_body
        };
        if msg_type == MessageType::CloseChannel && nb_chunks > 1 {
            return Err(SendFailed::Fatal(StatusCode::BAD_ENCODING_ERROR));
        }
        let max_chunks = self.tcp.send_max_chunk_count as usize;
        if max_chunks != 0 && nb_chunks > max_chunks {
            return Err(SendFailed::Reported(too_large));
        }

        let mut request_id = 0;
        for i in 0..nb_chunks {
            let is_last = i + 1 == nb_chunks;
            let end = if is_last {
                ChunkEnd::Final
            } else {
                ChunkEnd::Intermediate
            };
            let offset = i * max_body;
            let slice = &body[offset..(offset + max_body).min(body.len())];
            let result =
                self.encode_symmetric_chunk(msg_type, end, slice, request_id_or_handle, i as u32);
            match result {
                Ok((buf, id)) => {
                    request_id = id;
                    self.transmit(ctx, buf);
                }
                Err(status) if i == 0 => {
                    // Nothing on the wire yet; a plain failure suffices
                    return Err(SendFailed::Reported(status));
                }
                Err(status) => {
                    debug!(self.log(), "chunk encoding failed mid-message";
                           "chunk" => i, "status" => status);
                    match self.send_abort_chunk(ctx, now, status, request_id_or_handle) {
                        Ok(()) => return Err(SendFailed::Reported(status)),
                        Err(abort_err) => return Err(SendFailed::Fatal(abort_err)),
                    }
                }
            }
        }

        if self.side.is_client() && msg_type == MessageType::Message {
            self.register_sent_request(
                ctx,
                now,
                request_id,
                MessageType::Message,
                request_id_or_handle,
            );
        }
        Ok(())
    }

    /// Emit a final `'A'` chunk carrying `(status, reason)`; the channel
    /// stays open (spec §4.1.5 rule 6).
    pub(crate) fn send_abort_chunk(
        &mut self,
        ctx: &mut Context,
        now: u64,
        status: StatusCode,
        request_id_or_handle: u32,
    ) -> Result<(), StatusCode> {
        let _ = now;
        let mut reason = format!("{}", status);
        reason.truncate(MAX_URL_AND_REASON_LENGTH);
        let mut body = Vec::new();
        ErrorMessage {
            error: status,
            reason: Some(reason),
        }
        .encode(&mut body);
        let (buf, _) = self.encode_symmetric_chunk(
            MessageType::Message,
            ChunkEnd::Abort,
            &body,
            request_id_or_handle,
            u32::max_value(),
        )?;
        self.transmit(ctx, buf);
        Ok(())
    }

    fn symmetric_max_body_size(&self) -> Result<usize, StatusCode> {
        let sizes = self.symmetric_sending_crypto()?;
        compute_max_body_size(
            TCP_HEADER_SIZE + 4 + SYMMETRIC_HEADER_SIZE,
            self.tcp.send_buffer_size as usize,
            sizes.to_encrypt,
            sizes.cipher_block,
            sizes.plain_block,
            sizes.to_sign,
            sizes.signature_size,
        )
    }

    /// The token id and key set a sender must apply: a server keeps using
    /// the precedent token until the client activates the renewed one.
    fn sending_token(&self) -> Result<(u32, Option<&KeySet>), StatusCode> {
        let use_precedent = self.side.is_server()
            && !self.server_new_token_active
            && self.precedent_token.is_some();
        let token = if use_precedent {
            self.precedent_token.as_ref()
        } else {
            self.current_token.as_ref()
        };
        let token = token.ok_or(StatusCode::BAD_TCP_INTERNAL_ERROR)?;
        let keys = if use_precedent {
            self.precedent_keys.as_ref()
        } else {
            self.current_keys.as_ref()
        };
        Ok((token.token_id, keys.map(|k| &k.sender)))
    }

    fn encode_symmetric_chunk(
        &mut self,
        msg_type: MessageType,
        end: ChunkEnd,
        body: &[u8],
        request_id_or_handle: u32,
        chunk_index: u32,
    ) -> Result<(Vec<u8>, u32), StatusCode> {
        trace!(self.log(), "encoding chunk"; "type" => ?msg_type, "end" => ?end,
               "index" => chunk_index, "body" => body.len());
        #[cfg(test)]
        {
            if self.fail_chunk_encode == Some(chunk_index) {
                self.fail_chunk_encode = None;
                return Err(StatusCode::BAD_ENCODING_ERROR);
            }
        }
        const PREFIX: usize = TCP_HEADER_SIZE + 4 + SYMMETRIC_HEADER_SIZE;
        let sizes = self.symmetric_sending_crypto()?;
        let channel_id = self
            .current_token
            .as_ref()
            .map_or(0, |t| t.secure_channel_id);
        let (token_id, sender_keys) = {
            let (token_id, keys) = self.sending_token()?;
            (token_id, keys.cloned())
        };
        if (sizes.to_sign || sizes.to_encrypt) && sender_keys.is_none() {
            return Err(StatusCode::BAD_TCP_INTERNAL_ERROR);
        }

        let is_final = end != ChunkEnd::Intermediate;
        let request_id = self.chunk_request_id(is_final, request_id_or_handle);
        let mut buf = Vec::with_capacity(PREFIX + body.len() + 64);
        TcpHeader {
            message_type: msg_type,
            end,
            size: 0,
        }
        .encode(&mut buf);
        buf.write(channel_id);
        buf.write(token_id);
        SequenceHeader {
            sequence_number: self.next_sequence_number(),
            request_id,
        }
        .encode(&mut buf);
        buf.extend_from_slice(body);

        if sizes.to_encrypt {
            let padding =
                compute_padding_size(buf.len() - PREFIX, sizes.plain_block, sizes.signature_size);
            write_padding(&mut buf, padding, sizes.plain_block);
            let plain_len = buf.len() - PREFIX + sizes.signature_size;
            debug_assert_eq!(plain_len % sizes.plain_block, 0);
            let cipher_len = plain_len / sizes.plain_block * sizes.cipher_block;
            set_message_size(&mut buf, PREFIX + cipher_len);
        } else {
            let total = buf.len() + if sizes.to_sign { sizes.signature_size } else { 0 };
            set_message_size(&mut buf, total);
        }

        if sizes.to_sign {
            let crypto = self.crypto.as_ref().unwrap();
            let keys = sender_keys.as_ref().unwrap();
            let signature = crypto.symmetric_sign(keys, &buf);
            buf.extend_from_slice(&signature);
        }
        if sizes.to_encrypt {
            let crypto = self.crypto.as_ref().unwrap();
            let keys = sender_keys.as_ref().unwrap();
            let cipher = crypto.symmetric_encrypt(keys, &buf[PREFIX..])?;
            buf.truncate(PREFIX);
            buf.extend_from_slice(&cipher);
        }
        Ok((buf, request_id))
    }

    fn register_sent_request(
        &mut self,
        ctx: &mut Context,
        now: u64,
        request_id: u32,
        msg_type: MessageType,
        request_handle: u32,
    ) {
        self.sent_requests.insert(
            request_id,
            SentRequest {
                timeout_expired: false,
                request_handle,
                msg_type,
                timer_armed: true,
            },
        );
        ctx.io.push_back(Io::TimerStart {
            timer: Timer::Request(self.handle, request_id),
            time: now + ctx.config.request_timeout_ms,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn max_body_without_security_is_buffer_minus_headers() {
        // 8 header + 4 channel + 4 token + 8 sequence header
        let max = compute_max_body_size(16, 8192, false, 1, 1, false, 0).unwrap();
        assert_eq!(max, 8192 - 16 - 8);
    }

    #[test]
    fn max_body_with_aes_and_hmac() {
        let max = compute_max_body_size(16, 8192, true, 16, 16, true, 32).unwrap();
        // Whole blocks after the clear-text prefix, minus sequence header,
        // signature and the single padding-size byte
        assert_eq!(max, 16 * ((8192 - 16) / 16) - 8 - 32 - 1);
        // Body of that size round-trips to exactly the buffer size
        let padding = compute_padding_size(8 + max, 16, 32);
        assert!(16 + 8 + max + 1 + padding + 32 <= 8192);
    }

    #[test]
    fn max_body_detects_undersized_buffer() {
        assert!(compute_max_body_size(16, 16, true, 16, 16, true, 32).is_err());
        assert!(compute_max_body_size(32, 16, false, 1, 1, false, 0).is_err());
    }

    #[test]
    fn padding_fills_the_block() {
        for body in 0..64 {
            let padding = compute_padding_size(8 + body, 16, 32);
            assert_eq!((8 + body + 32 + 1 + padding) % 16, 0, "body {}", body);
            assert!(padding < 16);
        }
    }

    #[test]
    fn padding_round_trips() {
        let mut buf = vec![0xAB; 23];
        let padding = compute_padding_size(23, 16, 0);
        write_padding(&mut buf, padding, 16);
        assert_eq!(buf.len() % 16, 0);
        strip_padding(&mut buf, 16).unwrap();
        assert_eq!(buf, vec![0xAB; 23]);
    }

    #[test]
    fn extra_padding_byte_for_large_blocks() {
        assert!(!has_extra_padding(256));
        assert!(has_extra_padding(512));
        let mut buf = vec![7; 100];
        let padding = compute_padding_size(100, 512, 64);
        write_padding(&mut buf, padding, 512);
        // padding bytes + size byte + extra size byte
        assert_eq!(buf.len(), 100 + padding + 2);
        assert_eq!((100 + padding + 2 + 64) % 512, 0);
        strip_padding(&mut buf, 512).unwrap();
        assert_eq!(buf, vec![7; 100]);
    }

    #[test]
    fn chunk_ctx_reframes_partial_input() {
        let mut ctx = ChunkCtx::new();
        let mut msg = Vec::new();
        TcpHeader {
            message_type: MessageType::Hello,
            end: ChunkEnd::Final,
            size: 0,
        }
        .encode(&mut msg);
        msg.extend_from_slice(&[1, 2, 3, 4]);
        let size = msg.len();
        set_message_size(&mut msg, size);

        // Byte-by-byte arrival yields exactly one chunk
        for &b in &msg[..msg.len() - 1] {
            ctx.push(&[b]);
            assert_matches!(ctx.next_chunk(8192), Ok(None));
        }
        ctx.push(&msg[msg.len() - 1..]);
        let (header, raw) = ctx.next_chunk(8192).unwrap().unwrap();
        assert_eq!(header.message_type, MessageType::Hello);
        assert_eq!(&raw[TCP_HEADER_SIZE..], &[1, 2, 3, 4]);
        assert_matches!(ctx.next_chunk(8192), Ok(None));

        // Two messages in one buffer come out as two chunks
        ctx.push(&msg);
        ctx.push(&msg);
        assert!(ctx.next_chunk(8192).unwrap().is_some());
        assert!(ctx.next_chunk(8192).unwrap().is_some());
        assert_matches!(ctx.next_chunk(8192), Ok(None));
    }

    #[test]
    fn chunk_ctx_rejects_oversized_chunk() {
        let mut ctx = ChunkCtx::new();
        let mut msg = Vec::new();
        TcpHeader {
            message_type: MessageType::Message,
            end: ChunkEnd::Final,
            size: 0,
        }
        .encode(&mut msg);
        set_message_size(&mut msg, 9000);
        ctx.push(&msg);
        assert_eq!(
            ctx.next_chunk(8192),
            Err(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE)
        );
    }
}
