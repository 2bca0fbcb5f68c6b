//! Wire format of OPC UA TCP message chunks (Part 6 §7.1).

use bytes::{Buf, BufMut, Bytes};

use coding::{BufExt, BufMutExt, Codec, CodecError, Result};
use {SecurityMode, StatusCode, MAX_POLICY_URI_LENGTH, MAX_URL_AND_REASON_LENGTH};

/// The three-letter message type of the common header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MessageType {
    Hello,
    Acknowledge,
    Error,
    ReverseHello,
    OpenChannel,
    CloseChannel,
    Message,
}

impl MessageType {
    pub fn from_bytes(x: &[u8]) -> Option<MessageType> {
        match x {
            b"HEL" => Some(MessageType::Hello),
            b"ACK" => Some(MessageType::Acknowledge),
            b"ERR" => Some(MessageType::Error),
            b"RHE" => Some(MessageType::ReverseHello),
            b"OPN" => Some(MessageType::OpenChannel),
            b"CLO" => Some(MessageType::CloseChannel),
            b"MSG" => Some(MessageType::Message),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> &'static [u8; 3] {
        match self {
            MessageType::Hello => b"HEL",
            MessageType::Acknowledge => b"ACK",
            MessageType::Error => b"ERR",
            MessageType::ReverseHello => b"RHE",
            MessageType::OpenChannel => b"OPN",
            MessageType::CloseChannel => b"CLO",
            MessageType::Message => b"MSG",
        }
    }

    /// Whether a secure-channel header (channel id + security header)
    /// follows the common header.
    pub fn is_secured(self) -> bool {
        match self {
            MessageType::OpenChannel | MessageType::CloseChannel | MessageType::Message => true,
            _ => false,
        }
    }
}

/// The `IsFinal` byte: `'C'` intermediate, `'F'` final, `'A'` abort.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChunkEnd {
    Intermediate,
    Final,
    Abort,
}

impl ChunkEnd {
    pub fn from_byte(x: u8) -> Option<ChunkEnd> {
        match x {
            b'C' => Some(ChunkEnd::Intermediate),
            b'F' => Some(ChunkEnd::Final),
            b'A' => Some(ChunkEnd::Abort),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ChunkEnd::Intermediate => b'C',
            ChunkEnd::Final => b'F',
            ChunkEnd::Abort => b'A',
        }
    }
}

/// The 8-byte common header of every chunk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TcpHeader {
    pub message_type: MessageType,
    pub end: ChunkEnd,
    /// Total chunk size in bytes, header included.
    pub size: u32,
}

impl TcpHeader {
    /// Decode and validate a common header (spec receive rule 1).
    ///
    /// Only MSG chunks may carry an `IsFinal` other than `'F'`.
    pub fn decode(raw: &[u8; 8]) -> ::std::result::Result<TcpHeader, StatusCode> {
        let message_type = MessageType::from_bytes(&raw[..3])
            .ok_or(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID)?;
        let end =
            ChunkEnd::from_byte(raw[3]).ok_or(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID)?;
        if message_type != MessageType::Message && end != ChunkEnd::Final {
            return Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
        }
        let size = u32::from(raw[4])
            | u32::from(raw[5]) << 8
            | u32::from(raw[6]) << 16
            | u32::from(raw[7]) << 24;
        if size <= 8 {
            return Err(StatusCode::BAD_ENCODING_ERROR);
        }
        Ok(TcpHeader {
            message_type,
            end,
            size,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.message_type.as_bytes());
        buf.put_u8(self.end.as_byte());
        buf.put_u32_le(self.size);
    }
}

/// HEL body (Part 6 Table 36).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Hello {
    pub version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: Option<String>,
}

impl Codec for Hello {
    fn decode<B: Buf>(buf: &mut B) -> Result<Hello> {
        Ok(Hello {
            version: buf.get()?,
            receive_buffer_size: buf.get()?,
            send_buffer_size: buf.get()?,
            max_message_size: buf.get()?,
            max_chunk_count: buf.get()?,
            endpoint_url: buf.get_string(MAX_URL_AND_REASON_LENGTH)?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.version);
        buf.write(self.receive_buffer_size);
        buf.write(self.send_buffer_size);
        buf.write(self.max_message_size);
        buf.write(self.max_chunk_count);
        buf.write_string(self.endpoint_url.as_ref().map(|s| &s[..]));
    }
}

/// ACK body (Part 6 Table 37).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Acknowledge {
    pub version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

impl Codec for Acknowledge {
    fn decode<B: Buf>(buf: &mut B) -> Result<Acknowledge> {
        Ok(Acknowledge {
            version: buf.get()?,
            receive_buffer_size: buf.get()?,
            send_buffer_size: buf.get()?,
            max_message_size: buf.get()?,
            max_chunk_count: buf.get()?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.version);
        buf.write(self.receive_buffer_size);
        buf.write(self.send_buffer_size);
        buf.write(self.max_message_size);
        buf.write(self.max_chunk_count);
    }
}

/// ERR body, also used as the body of an abort (`'A'`) chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorMessage {
    pub error: StatusCode,
    pub reason: Option<String>,
}

impl Codec for ErrorMessage {
    fn decode<B: Buf>(buf: &mut B) -> Result<ErrorMessage> {
        Ok(ErrorMessage {
            error: StatusCode(buf.get()?),
            reason: buf.get_string(MAX_URL_AND_REASON_LENGTH)?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.error.0);
        buf.write_string(self.reason.as_ref().map(|s| &s[..]));
    }
}

/// RHE body (Part 6 §7.1.2.6).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReverseHello {
    pub server_uri: Option<String>,
    pub endpoint_url: Option<String>,
}

impl Codec for ReverseHello {
    fn decode<B: Buf>(buf: &mut B) -> Result<ReverseHello> {
        Ok(ReverseHello {
            server_uri: buf.get_string(MAX_URL_AND_REASON_LENGTH)?,
            endpoint_url: buf.get_string(MAX_URL_AND_REASON_LENGTH)?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_string(self.server_uri.as_ref().map(|s| &s[..]));
        buf.write_string(self.endpoint_url.as_ref().map(|s| &s[..]));
    }
}

/// Asymmetric security header of an OPN chunk (Part 6 Table 27).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AsymmetricHeader {
    pub policy_uri: String,
    pub sender_certificate: Option<Bytes>,
    pub receiver_thumbprint: Option<Bytes>,
}

impl Codec for AsymmetricHeader {
    fn decode<B: Buf>(buf: &mut B) -> Result<AsymmetricHeader> {
        let policy_uri = match buf.get_string(MAX_POLICY_URI_LENGTH)? {
            Some(uri) => uri,
            None => return Err(CodecError),
        };
        Ok(AsymmetricHeader {
            policy_uri,
            sender_certificate: buf.get_byte_string()?,
            receiver_thumbprint: buf.get_byte_string()?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_string(Some(&self.policy_uri));
        buf.write_byte_string(self.sender_certificate.as_ref().map(|b| &b[..]));
        buf.write_byte_string(self.receiver_thumbprint.as_ref().map(|b| &b[..]));
    }
}

impl AsymmetricHeader {
    pub fn encoded_len(&self) -> usize {
        let bs = |x: &Option<Bytes>| 4 + x.as_ref().map_or(0, |b| b.len());
        4 + self.policy_uri.len()
            + bs(&self.sender_certificate)
            + bs(&self.receiver_thumbprint)
    }
}

/// Sequence header present in every OPN/CLO/MSG chunk (Part 6 Table 29).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl Codec for SequenceHeader {
    fn decode<B: Buf>(buf: &mut B) -> Result<SequenceHeader> {
        Ok(SequenceHeader {
            sequence_number: buf.get()?,
            request_id: buf.get()?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.sequence_number);
        buf.write(self.request_id);
    }
}

// Binary encoding ids of the service messages carried by OPN/CLO bodies.
const OPEN_CHANNEL_REQUEST_ID: u16 = 446;
const OPEN_CHANNEL_RESPONSE_ID: u16 = 449;
const CLOSE_CHANNEL_REQUEST_ID: u16 = 452;

fn decode_type_id<B: Buf>(buf: &mut B) -> Result<u16> {
    // Four-byte numeric NodeId: encoding byte, namespace, u16 identifier
    if buf.get::<u8>()? != 0x01 || buf.get::<u8>()? != 0x00 {
        return Err(CodecError);
    }
    let lo = buf.get::<u8>()?;
    let hi = buf.get::<u8>()?;
    Ok(u16::from(lo) | u16::from(hi) << 8)
}

fn encode_type_id<B: BufMut>(id: u16, buf: &mut B) {
    buf.put_u8(0x01);
    buf.put_u8(0x00);
    buf.put_u8(id as u8);
    buf.put_u8((id >> 8) as u8);
}

/// The subset of a `RequestHeader` the transport layer reads and writes;
/// the remaining fields are encoded as their null values.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RequestHeader {
    pub timestamp: i64,
    pub request_handle: u32,
    pub timeout_hint: u32,
}

impl Codec for RequestHeader {
    fn decode<B: Buf>(buf: &mut B) -> Result<RequestHeader> {
        // Null authentication token (two-byte NodeId)
        if buf.get::<u8>()? != 0x00 {
            return Err(CodecError);
        }
        let _ = buf.get::<u8>()?;
        let timestamp = buf.get::<i64>()?;
        let request_handle = buf.get::<u32>()?;
        let _return_diagnostics = buf.get::<u32>()?;
        let _audit_entry_id = buf.get_string(MAX_URL_AND_REASON_LENGTH)?;
        let timeout_hint = buf.get::<u32>()?;
        // Null additional header: null NodeId + encoding byte
        let _ = buf.get::<u8>()?;
        let _ = buf.get::<u8>()?;
        let _ = buf.get::<u8>()?;
        Ok(RequestHeader {
            timestamp,
            request_handle,
            timeout_hint,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.write(self.timestamp);
        buf.write(self.request_handle);
        buf.write(0u32);
        buf.write_string(None);
        buf.write(self.timeout_hint);
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u8(0x00);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ResponseHeader {
    pub timestamp: i64,
    pub request_handle: u32,
    pub service_result: StatusCode,
}

impl Codec for ResponseHeader {
    fn decode<B: Buf>(buf: &mut B) -> Result<ResponseHeader> {
        let timestamp = buf.get::<i64>()?;
        let request_handle = buf.get::<u32>()?;
        let service_result = StatusCode(buf.get::<u32>()?);
        // Empty service diagnostics
        let _ = buf.get::<u8>()?;
        // Null string table
        if buf.get::<i32>()? > 0 {
            return Err(CodecError);
        }
        // Null additional header
        let _ = buf.get::<u8>()?;
        let _ = buf.get::<u8>()?;
        let _ = buf.get::<u8>()?;
        Ok(ResponseHeader {
            timestamp,
            request_handle,
            service_result,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.timestamp);
        buf.write(self.request_handle);
        buf.write(self.service_result.0);
        buf.put_u8(0x00);
        buf.write::<i32>(-1);
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u8(0x00);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpenRequestType {
    Issue,
    Renew,
}

/// `OpenSecureChannelRequest` body of an OPN request chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenChannelRequest {
    pub header: RequestHeader,
    pub client_protocol_version: u32,
    pub request_type: OpenRequestType,
    pub security_mode: SecurityMode,
    pub client_nonce: Option<Bytes>,
    pub requested_lifetime_ms: u32,
}

impl Codec for OpenChannelRequest {
    fn decode<B: Buf>(buf: &mut B) -> Result<OpenChannelRequest> {
        if decode_type_id(buf)? != OPEN_CHANNEL_REQUEST_ID {
            return Err(CodecError);
        }
        let header = RequestHeader::decode(buf)?;
        let client_protocol_version = buf.get::<u32>()?;
        let request_type = match buf.get::<u32>()? {
            0 => OpenRequestType::Issue,
            1 => OpenRequestType::Renew,
            _ => return Err(CodecError),
        };
        let security_mode =
            SecurityMode::from_wire(buf.get::<u32>()?).ok_or(CodecError)?;
        let client_nonce = buf.get_byte_string()?;
        let requested_lifetime_ms = buf.get::<u32>()?;
        Ok(OpenChannelRequest {
            header,
            client_protocol_version,
            request_type,
            security_mode,
            client_nonce,
            requested_lifetime_ms,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        encode_type_id(OPEN_CHANNEL_REQUEST_ID, buf);
        self.header.encode(buf);
        buf.write(self.client_protocol_version);
        buf.write(match self.request_type {
            OpenRequestType::Issue => 0u32,
            OpenRequestType::Renew => 1u32,
        });
        buf.write(self.security_mode.to_wire());
        buf.write_byte_string(self.client_nonce.as_ref().map(|b| &b[..]));
        buf.write(self.requested_lifetime_ms);
    }
}

/// `OpenSecureChannelResponse` body of an OPN response chunk.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenChannelResponse {
    pub header: ResponseHeader,
    pub server_protocol_version: u32,
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: i64,
    pub revised_lifetime_ms: u32,
    pub server_nonce: Option<Bytes>,
}

impl Codec for OpenChannelResponse {
    fn decode<B: Buf>(buf: &mut B) -> Result<OpenChannelResponse> {
        if decode_type_id(buf)? != OPEN_CHANNEL_RESPONSE_ID {
            return Err(CodecError);
        }
        let header = ResponseHeader::decode(buf)?;
        let server_protocol_version = buf.get::<u32>()?;
        let channel_id = buf.get::<u32>()?;
        let token_id = buf.get::<u32>()?;
        let created_at = buf.get::<i64>()?;
        let revised_lifetime_ms = buf.get::<u32>()?;
        let server_nonce = buf.get_byte_string()?;
        Ok(OpenChannelResponse {
            header,
            server_protocol_version,
            channel_id,
            token_id,
            created_at,
            revised_lifetime_ms,
            server_nonce,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        encode_type_id(OPEN_CHANNEL_RESPONSE_ID, buf);
        self.header.encode(buf);
        buf.write(self.server_protocol_version);
        buf.write(self.channel_id);
        buf.write(self.token_id);
        buf.write(self.created_at);
        buf.write(self.revised_lifetime_ms);
        buf.write_byte_string(self.server_nonce.as_ref().map(|b| &b[..]));
    }
}

/// `CloseSecureChannelRequest` body of a CLO chunk; carries nothing the
/// transport layer uses beyond its header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseChannelRequest {
    pub header: RequestHeader,
}

impl Codec for CloseChannelRequest {
    fn decode<B: Buf>(buf: &mut B) -> Result<CloseChannelRequest> {
        if decode_type_id(buf)? != CLOSE_CHANNEL_REQUEST_ID {
            return Err(CodecError);
        }
        Ok(CloseChannelRequest {
            header: RequestHeader::decode(buf)?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        encode_type_id(CLOSE_CHANNEL_REQUEST_ID, buf);
        self.header.encode(buf);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn round_trip<T: Codec + PartialEq + ::std::fmt::Debug>(x: T) {
        let mut buf = Vec::new();
        x.encode(&mut buf);
        let decoded = T::decode(&mut Cursor::new(&buf[..])).unwrap();
        assert_eq!(x, decoded);
    }

    #[test]
    fn tcp_header() {
        let hdr = TcpHeader {
            message_type: MessageType::Message,
            end: ChunkEnd::Intermediate,
            size: 0x1234,
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        assert_eq!(buf, hex!("4d 53 47 43 34 12 00 00"));
        let mut raw = [0; 8];
        raw.copy_from_slice(&buf);
        assert_eq!(TcpHeader::decode(&raw), Ok(hdr));
    }

    #[test]
    fn tcp_header_rejects_bad_type() {
        let raw = *b"XYZF\x10\x00\x00\x00";
        assert_eq!(
            TcpHeader::decode(&raw),
            Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID)
        );
    }

    #[test]
    fn tcp_header_rejects_non_final_hello() {
        let raw = *b"HELC\x10\x00\x00\x00";
        assert_eq!(
            TcpHeader::decode(&raw),
            Err(StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID)
        );
    }

    #[test]
    fn tcp_header_rejects_undersized() {
        let raw = *b"HELF\x08\x00\x00\x00";
        assert_eq!(TcpHeader::decode(&raw), Err(StatusCode::BAD_ENCODING_ERROR));
    }

    #[test]
    fn plain_bodies_round_trip() {
        round_trip(Hello {
            version: 0,
            receive_buffer_size: 65536,
            send_buffer_size: 65536,
            max_message_size: 1 << 21,
            max_chunk_count: 64,
            endpoint_url: Some("opc.tcp://localhost:4840/test".to_string()),
        });
        round_trip(Acknowledge {
            version: 0,
            receive_buffer_size: 8192,
            send_buffer_size: 8192,
            max_message_size: 0,
            max_chunk_count: 0,
        });
        round_trip(ErrorMessage {
            error: StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
            reason: Some("token expired".to_string()),
        });
        round_trip(ReverseHello {
            server_uri: Some("urn:example:server".to_string()),
            endpoint_url: Some("opc.tcp://10.0.0.1:4840".to_string()),
        });
    }

    #[test]
    fn security_headers_round_trip() {
        round_trip(AsymmetricHeader {
            policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".to_string(),
            sender_certificate: None,
            receiver_thumbprint: None,
        });
        let hdr = AsymmetricHeader {
            policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256".to_string(),
            sender_certificate: Some(vec![3; 42].into()),
            receiver_thumbprint: Some(vec![7; 20].into()),
        };
        let mut buf = Vec::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), hdr.encoded_len());
        round_trip(hdr);
        round_trip(SequenceHeader {
            sequence_number: 51,
            request_id: 3,
        });
    }

    #[test]
    fn open_channel_bodies_round_trip() {
        round_trip(OpenChannelRequest {
            header: RequestHeader {
                timestamp: 1234,
                request_handle: 9,
                timeout_hint: 5000,
            },
            client_protocol_version: 0,
            request_type: OpenRequestType::Issue,
            security_mode: SecurityMode::SignAndEncrypt,
            client_nonce: Some(vec![0xAB; 32].into()),
            requested_lifetime_ms: 60_000,
        });
        round_trip(OpenChannelResponse {
            header: ResponseHeader {
                timestamp: 1234,
                request_handle: 9,
                service_result: StatusCode::GOOD,
            },
            server_protocol_version: 0,
            channel_id: 0xCAFE,
            token_id: 0xF00D,
            created_at: 777,
            revised_lifetime_ms: 60_000,
            server_nonce: Some(vec![0xCD; 32].into()),
        });
        round_trip(CloseChannelRequest {
            header: RequestHeader {
                timestamp: 0,
                request_handle: 1,
                timeout_hint: 0,
            },
        });
    }
}
