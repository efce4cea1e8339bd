//! Packet encoding and decoding for the remote LAN control stream.
//!
//! Every packet starts with the same 16-byte header:
//!
//! ```text
//! [0]      type tag (equals the packet length)
//! [1..6]   reserved; byte 4 carries the framing packet type
//! [6..8]   sequence number, little-endian
//! [8..12]  sender session id, big-endian
//! [12..16] receiver session id, big-endian
//! ```
//!
//! Authenticated packets (login, auth, stream request) continue with:
//!
//! ```text
//! [16..20] length/type marker
//! [20]     direction (0x01 = request)
//! [21]     magic byte, see [`AuthMagic`]
//! [22..24] inner sequence number, little-endian
//! [26..32] auth id
//! ```
//!
//! Builders return complete datagrams. Parsers take a whole received
//! datagram and return `None` (or an error) when it does not have the
//! expected shape.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use icomlan_core::error::{Error, Result};

/// Control stream UDP port.
pub const CONTROL_PORT: u16 = 50001;
/// Serial (CI-V) stream UDP port.
pub const SERIAL_PORT: u16 = 50002;
/// Audio stream UDP port.
pub const AUDIO_PORT: u16 = 50003;

pub const HEADER_LEN: usize = 16;
pub const PING_LEN: usize = 21;
pub const AUTH_LEN: usize = 64;
pub const DISCONNECT_REPLY_LEN: usize = 80;
pub const LOGIN_REPLY_LEN: usize = 96;
pub const LOGIN_LEN: usize = 128;
pub const STREAM_REQUEST_LEN: usize = 144;
pub const STREAM_GRANT_LEN: usize = 144;

/// Width of the fixed, NUL-padded text fields.
pub const NAME_FIELD_LEN: usize = 16;

/// Codec byte for 16-bit linear PCM, mono.
pub const CODEC_LPCM_16_MONO: u8 = 0x04;

/// Offset of the inner sequence number in authenticated packets.
pub const INNER_SEQ_OFFSET: usize = 22;
/// Offset of the auth id in authenticated packets.
pub const AUTH_ID_OFFSET: usize = 26;
/// Offset of the magic byte in authenticated packets.
pub const MAGIC_OFFSET: usize = 21;

/// Prefix of the "I am here" reply to "are you there".
pub const I_AM_HERE_PREFIX: [u8; 8] = [0x10, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00];
/// Prefix of the reply to "are you ready".
pub const READY_PREFIX: [u8; 8] = [0x10, 0x00, 0x00, 0x00, 0x06, 0x00, 0x01, 0x00];
/// Prefix of the login reply.
pub const LOGIN_REPLY_PREFIX: [u8; 8] = [0x60, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00];

/// Stream request bytes 32..48, copied from the radio's own replies.
const STREAM_REQUEST_FIXED: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x80, 0x00, 0x00, 0x90, 0xc7, 0x0e, 0x86, 0x01,
];

/// Framing packet types (byte 4 of a 16-byte packet).
const FRAME_IDLE: u8 = 0x00;
const FRAME_ARE_YOU_THERE: u8 = 0x03;
const FRAME_DISCONNECT: u8 = 0x05;
const FRAME_ARE_YOU_READY: u8 = 0x06;
const FRAME_PING: u8 = 0x07;

/// Length/type markers at bytes 16..20.
const MARKER_LOGIN: u32 = 0x70;
const MARKER_AUTH: u32 = 0x30;
const MARKER_STREAM_REQUEST: u32 = 0x80;

const DIRECTION_REQUEST: u8 = 0x01;

/// Six-byte authentication id issued by the radio.
pub type AuthId = [u8; 6];

/// Local and remote session identifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionIds {
    pub local: u32,
    pub remote: u32,
}

/// Magic byte of an authenticated packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMagic {
    Login = 0x00,
    Deauth = 0x01,
    FirstAuth = 0x02,
    StreamRequest = 0x03,
    Reauth = 0x05,
}

/// Login credentials. Sent in plain text inside the login packet.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Capability block of the stream request (bytes 112..137).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCapabilities {
    /// Request receive audio.
    pub rx_enabled: bool,
    /// Request transmit audio.
    pub tx_enabled: bool,
    /// Codec for both directions.
    pub codec: u8,
    /// Sample rate for both directions, in hertz.
    pub sample_rate: u32,
    /// Local port of the serial stream.
    pub serial_port: u16,
    /// Local port of the audio stream.
    pub audio_port: u16,
    /// Radio-side transmit buffer length.
    pub tx_buffer: Duration,
}

impl Default for StreamCapabilities {
    fn default() -> Self {
        StreamCapabilities {
            rx_enabled: true,
            tx_enabled: true,
            codec: CODEC_LPCM_16_MONO,
            sample_rate: icomlan_core::SAMPLE_RATE,
            serial_port: SERIAL_PORT,
            audio_port: AUDIO_PORT,
            tx_buffer: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn put_header(buf: &mut BytesMut, len: usize, frame_type: u8, seq: u16, ids: SessionIds) {
    buf.put_u8(len as u8);
    buf.put_bytes(0, 3);
    buf.put_u8(frame_type);
    buf.put_u8(0);
    buf.put_u16_le(seq);
    buf.put_u32(ids.local);
    buf.put_u32(ids.remote);
}

/// Bytes 16..32 of an authenticated packet.
fn put_auth_prefix(buf: &mut BytesMut, marker: u32, magic: AuthMagic, inner_seq: u16, id: &AuthId) {
    buf.put_u32(marker);
    buf.put_u8(DIRECTION_REQUEST);
    buf.put_u8(magic as u8);
    buf.put_u16_le(inner_seq);
    buf.put_bytes(0, 2);
    buf.put_slice(id);
}

/// Write `text` into a NUL-padded field, truncated to leave a terminator.
fn put_name(buf: &mut BytesMut, text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(NAME_FIELD_LEN - 1);
    buf.put_slice(&bytes[..n]);
    buf.put_bytes(0, NAME_FIELD_LEN - n);
}

fn framing(frame_type: u8, seq: u16, ids: SessionIds) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    put_header(&mut buf, HEADER_LEN, frame_type, seq, ids);
    buf.freeze()
}

/// "Are you there": the first packet of a session. The remote id is not
/// known yet and is sent as zero.
pub fn are_you_there(local: u32) -> Bytes {
    framing(FRAME_ARE_YOU_THERE, 0, SessionIds { local, remote: 0 })
}

/// "Are you ready", sent once the remote id is known.
pub fn are_you_ready(ids: SessionIds) -> Bytes {
    framing(FRAME_ARE_YOU_READY, 1, ids)
}

/// Low-level disconnect, sent last on teardown.
pub fn disconnect(ids: SessionIds) -> Bytes {
    framing(FRAME_DISCONNECT, 0, ids)
}

/// Idle packet. Also used to answer the radio's idle packets with its own
/// sequence number.
pub fn idle(seq: u16, ids: SessionIds) -> Bytes {
    framing(FRAME_IDLE, seq, ids)
}

/// Ping request (`reply == false`) or reply.
pub fn ping(seq: u16, ids: SessionIds, reply: bool, token: [u8; 4]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PING_LEN);
    put_header(&mut buf, PING_LEN, FRAME_PING, seq, ids);
    buf.put_u8(reply as u8);
    buf.put_slice(&token);
    buf.freeze()
}

/// Fields of the login packet.
#[derive(Debug, Clone)]
pub struct Login<'a> {
    pub seq: u16,
    pub ids: SessionIds,
    pub inner_seq: u16,
    /// Echoed by the radio as the first two bytes of the auth id.
    pub client_id: u16,
    pub credentials: &'a Credentials,
    pub client_name: &'a str,
}

/// Encode the 128-byte login packet.
pub fn login(fields: &Login<'_>) -> Bytes {
    let mut buf = BytesMut::with_capacity(LOGIN_LEN);
    put_header(&mut buf, LOGIN_LEN, 0, fields.seq, fields.ids);
    let mut id = [0u8; 6];
    id[..2].copy_from_slice(&fields.client_id.to_be_bytes());
    put_auth_prefix(&mut buf, MARKER_LOGIN, AuthMagic::Login, fields.inner_seq, &id);
    buf.put_bytes(0, 64 - buf.len());
    put_name(&mut buf, &fields.credentials.username);
    put_name(&mut buf, &fields.credentials.password);
    put_name(&mut buf, fields.client_name);
    buf.put_bytes(0, LOGIN_LEN - buf.len());
    buf.freeze()
}

/// Encode the 64-byte auth packet (first auth, reauth or deauth).
pub fn auth(seq: u16, ids: SessionIds, magic: AuthMagic, inner_seq: u16, id: &AuthId) -> Bytes {
    let mut buf = BytesMut::with_capacity(AUTH_LEN);
    put_header(&mut buf, AUTH_LEN, 0, seq, ids);
    put_auth_prefix(&mut buf, MARKER_AUTH, magic, inner_seq, id);
    buf.put_bytes(0, AUTH_LEN - buf.len());
    buf.freeze()
}

/// Fields of the stream request packet.
#[derive(Debug, Clone)]
pub struct StreamRequest<'a> {
    pub seq: u16,
    pub ids: SessionIds,
    pub inner_seq: u16,
    pub auth_id: &'a AuthId,
    pub device_name: &'a str,
    pub username: &'a str,
    pub capabilities: &'a StreamCapabilities,
}

/// Encode the 144-byte serial and audio stream request.
pub fn stream_request(fields: &StreamRequest<'_>) -> Bytes {
    let caps = fields.capabilities;
    let mut buf = BytesMut::with_capacity(STREAM_REQUEST_LEN);
    put_header(&mut buf, STREAM_REQUEST_LEN, 0, fields.seq, fields.ids);
    put_auth_prefix(
        &mut buf,
        MARKER_STREAM_REQUEST,
        AuthMagic::StreamRequest,
        fields.inner_seq,
        fields.auth_id,
    );
    buf.put_slice(&STREAM_REQUEST_FIXED);
    buf.put_bytes(0, 16);
    put_name(&mut buf, fields.device_name);
    buf.put_bytes(0, 16);
    put_name(&mut buf, fields.username);

    buf.put_u8(caps.rx_enabled as u8);
    buf.put_u8(caps.tx_enabled as u8);
    buf.put_u8(caps.codec);
    buf.put_u8(caps.codec);
    buf.put_u32(caps.sample_rate);
    buf.put_u32(caps.sample_rate);
    buf.put_u32(u32::from(caps.serial_port));
    buf.put_u32(u32::from(caps.audio_port));
    buf.put_u32(caps.tx_buffer.as_millis().min(u32::MAX as u128) as u32);
    // Sample format conversion on the radio side.
    buf.put_u8(0x01);

    buf.put_bytes(0, STREAM_REQUEST_LEN - buf.len());
    buf.freeze()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn read_u16_le(r: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([r[at], r[at + 1]])
}

fn read_u32_be(r: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([r[at], r[at + 1], r[at + 2], r[at + 3]])
}

fn read_auth_id(r: &[u8]) -> AuthId {
    let mut id = [0u8; 6];
    id.copy_from_slice(&r[AUTH_ID_OFFSET..AUTH_ID_OFFSET + 6]);
    id
}

/// Sequence number of any packet (bytes 6..8).
pub fn sequence(r: &[u8]) -> Option<u16> {
    (r.len() >= 8).then(|| read_u16_le(r, 6))
}

/// The sender's session id (bytes 8..12) of a reply.
pub fn sender_id(r: &[u8]) -> Option<u32> {
    (r.len() >= 12).then(|| read_u32_be(r, 8))
}

/// Inner sequence number of an authenticated packet.
pub fn inner_sequence(r: &[u8]) -> Option<u16> {
    (r.len() >= 32).then(|| read_u16_le(r, INNER_SEQ_OFFSET))
}

/// Auth id embedded in an authenticated packet.
pub fn auth_id(r: &[u8]) -> Option<AuthId> {
    (r.len() >= 32).then(|| read_auth_id(r))
}

/// Magic byte of an authenticated packet.
pub fn magic(r: &[u8]) -> Option<u8> {
    r.get(MAGIC_OFFSET).copied()
}

/// Outcome of a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted(AuthId),
    InvalidCredentials,
}

/// Parse the 96-byte login reply.
pub fn parse_login_reply(r: &[u8]) -> Result<LoginOutcome> {
    if r.len() != LOGIN_REPLY_LEN || !r.starts_with(&LOGIN_REPLY_PREFIX) {
        return Err(Error::Protocol(format!(
            "malformed login reply ({} bytes)",
            r.len()
        )));
    }
    if r[48..52] == [0xff, 0xff, 0xff, 0xfe] {
        return Ok(LoginOutcome::InvalidCredentials);
    }
    Ok(LoginOutcome::Accepted(read_auth_id(r)))
}

/// A decoded 21-byte ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub seq: u16,
    pub is_reply: bool,
    pub token: [u8; 4],
}

pub fn parse_ping(r: &[u8]) -> Option<Ping> {
    if r.len() != PING_LEN || r[1..6] != [0x00, 0x00, 0x00, FRAME_PING, 0x00] {
        return None;
    }
    Some(Ping {
        seq: read_u16_le(r, 6),
        is_reply: r[16] != 0x00,
        token: [r[17], r[18], r[19], r[20]],
    })
}

/// The radio's grant of the serial and audio streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamGrant {
    /// Radio model name, e.g. `"IC-705"`.
    pub device_name: String,
    /// Session ids to use from now on.
    pub ids: SessionIds,
    /// Auth id to use from now on.
    pub auth_id: AuthId,
}

/// Parse a 144-byte stream grant. Returns `None` unless the success marker
/// is set.
pub fn parse_stream_grant(r: &[u8]) -> Option<StreamGrant> {
    if r.len() != STREAM_GRANT_LEN || r[..6] != [0x90, 0, 0, 0, 0, 0] || r[96] != 0x01 {
        return None;
    }
    let field = &r[64..64 + NAME_FIELD_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    Some(StreamGrant {
        device_name: String::from_utf8_lossy(&field[..end]).into_owned(),
        // The radio is the sender of this packet.
        ids: SessionIds {
            local: read_u32_be(r, 12),
            remote: read_u32_be(r, 8),
        },
        auth_id: read_auth_id(r),
    })
}
