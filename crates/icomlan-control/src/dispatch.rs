//! Classification of datagrams received on the control stream.
//!
//! The radio's replies carry no explicit type field; they are told apart by
//! length and a few leading bytes. [`REPLY_TABLE`] lists the recognized
//! shapes in match order and [`classify`] returns the first hit. Anything
//! else is dropped by the caller.

use crate::packet::{
    AUTH_LEN, AuthMagic, DISCONNECT_REPLY_LEN, HEADER_LEN, MAGIC_OFFSET, PING_LEN,
    STREAM_GRANT_LEN,
};

/// What a received datagram is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// The radio's idle packet; answered with an echo of its sequence.
    RemoteIdle,
    /// Ping request from the radio, or reply to ours.
    Ping,
    /// The radio acknowledged a magic-0x05 auth packet.
    SecondAuthAck,
    /// The radio rejected our authentication.
    AuthFailed,
    /// The radio closed the session.
    RemoteDisconnect,
    /// The radio granted the serial and audio streams.
    StreamGrant,
}

/// One row of the reply table.
#[derive(Debug, Clone, Copy)]
pub struct ReplyRule {
    /// Exact datagram length.
    pub len: usize,
    pub matcher: fn(&[u8]) -> bool,
    pub kind: ReplyKind,
}

/// Recognized replies, in match order.
pub const REPLY_TABLE: &[ReplyRule] = &[
    ReplyRule {
        len: HEADER_LEN,
        matcher: is_remote_idle,
        kind: ReplyKind::RemoteIdle,
    },
    ReplyRule {
        len: PING_LEN,
        matcher: is_ping,
        kind: ReplyKind::Ping,
    },
    ReplyRule {
        len: AUTH_LEN,
        matcher: is_second_auth_ack,
        kind: ReplyKind::SecondAuthAck,
    },
    ReplyRule {
        len: DISCONNECT_REPLY_LEN,
        matcher: is_auth_failure,
        kind: ReplyKind::AuthFailed,
    },
    ReplyRule {
        len: DISCONNECT_REPLY_LEN,
        matcher: is_remote_disconnect,
        kind: ReplyKind::RemoteDisconnect,
    },
    ReplyRule {
        len: STREAM_GRANT_LEN,
        matcher: is_stream_grant,
        kind: ReplyKind::StreamGrant,
    },
];

/// Classify a received datagram, or `None` if no rule matches.
pub fn classify(r: &[u8]) -> Option<ReplyKind> {
    REPLY_TABLE
        .iter()
        .find(|rule| rule.len == r.len() && (rule.matcher)(r))
        .map(|rule| rule.kind)
}

fn is_remote_idle(r: &[u8]) -> bool {
    r.starts_with(&[0x10, 0x00, 0x00, 0x00, 0x00, 0x00])
}

fn is_ping(r: &[u8]) -> bool {
    // Byte 0 is 0x15 or 0x00 depending on the sender.
    r[1..6] == [0x00, 0x00, 0x00, 0x07, 0x00]
}

fn is_second_auth_ack(r: &[u8]) -> bool {
    r.starts_with(&[0x40, 0x00, 0x00, 0x00, 0x00, 0x00]) && r[MAGIC_OFFSET] == AuthMagic::Reauth as u8
}

fn is_auth_failure(r: &[u8]) -> bool {
    r.starts_with(&[0x50, 0x00, 0x00, 0x00, 0x00, 0x00]) && r[48..51] == [0xff, 0xff, 0xff]
}

/// Byte 64 of an 80-byte status packet is set when the radio drops us.
const DISCONNECTED_MARKER: u8 = 0x01;

fn is_remote_disconnect(r: &[u8]) -> bool {
    r.starts_with(&[0x50, 0x00, 0x00, 0x00, 0x00, 0x00])
        && r[48..51] == [0x00, 0x00, 0x00]
        && r[64] == DISCONNECTED_MARKER
}

fn is_stream_grant(r: &[u8]) -> bool {
    r.starts_with(&[0x90, 0x00, 0x00, 0x00, 0x00, 0x00]) && r[96] == 0x01
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, SessionIds};

    const IDS: SessionIds = SessionIds {
        local: 0x1111_1111,
        remote: 0x2222_2222,
    };

    fn sized(len: usize, prefix: &[u8]) -> Vec<u8> {
        let mut r = vec![0u8; len];
        r[..prefix.len()].copy_from_slice(prefix);
        r
    }

    #[test]
    fn table_rows_have_distinct_kinds() {
        for rule in REPLY_TABLE {
            let count = REPLY_TABLE.iter().filter(|r| r.kind == rule.kind).count();
            assert_eq!(count, 1, "{:?} listed twice", rule.kind);
        }
    }

    #[test]
    fn idle_from_radio() {
        assert_eq!(classify(&packet::idle(0x13, IDS)), Some(ReplyKind::RemoteIdle));
    }

    #[test]
    fn framing_replies_are_not_idle() {
        let mut r = packet::idle(0, IDS).to_vec();
        r[4] = 0x04;
        assert_eq!(classify(&r), None);
    }

    #[test]
    fn ping_request_and_reply() {
        assert_eq!(
            classify(&packet::ping(1, IDS, false, [0; 4])),
            Some(ReplyKind::Ping)
        );
        let mut r = packet::ping(1, IDS, true, [0; 4]).to_vec();
        r[0] = 0x00;
        assert_eq!(classify(&r), Some(ReplyKind::Ping));
    }

    #[test]
    fn second_auth_ack_needs_reauth_magic() {
        let mut r = sized(64, &[0x40]);
        r[20] = 0x02;
        r[21] = 0x05;
        assert_eq!(classify(&r), Some(ReplyKind::SecondAuthAck));

        r[21] = 0x02;
        assert_eq!(classify(&r), None);
    }

    #[test]
    fn auth_failure() {
        let mut r = sized(80, &[0x50]);
        r[48..52].copy_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(classify(&r), Some(ReplyKind::AuthFailed));
    }

    #[test]
    fn remote_disconnect_needs_marker() {
        let mut r = sized(80, &[0x50]);
        r[64] = 0x01;
        assert_eq!(classify(&r), Some(ReplyKind::RemoteDisconnect));
    }

    #[test]
    fn connection_status_is_dropped() {
        // Marker clear: a plain status report.
        let r = sized(80, &[0x50]);
        assert_eq!(classify(&r), None);

        let mut r = sized(80, &[0x50]);
        r[48] = 0x01;
        r[64] = 0x01;
        assert_eq!(classify(&r), None);
    }

    #[test]
    fn stream_grant_needs_success_marker() {
        let mut r = sized(144, &[0x90]);
        assert_eq!(classify(&r), None);
        r[96] = 0x01;
        assert_eq!(classify(&r), Some(ReplyKind::StreamGrant));
    }

    #[test]
    fn unknown_lengths_are_dropped() {
        assert_eq!(classify(&[]), None);
        assert_eq!(classify(&sized(96, &[0x60])), None);
        assert_eq!(classify(&sized(168, &[0xa8])), None);
    }
}
