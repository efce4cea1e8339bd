//! Authentication context of a control session.

use crate::packet::AuthId;

/// Inner sequence counter and auth id shared by every authenticated packet.
#[derive(Debug, Clone)]
pub struct AuthContext {
    inner_seq: u16,
    auth_id: AuthId,
    authenticated: bool,
}

impl AuthContext {
    /// Start a context whose first authenticated packet uses `initial_seq`.
    pub fn new(initial_seq: u16) -> Self {
        AuthContext {
            inner_seq: initial_seq,
            auth_id: [0; 6],
            authenticated: false,
        }
    }

    /// Return the inner sequence for the next authenticated packet and
    /// advance the counter, wrapping at 65536.
    pub fn next_inner_seq(&mut self) -> u16 {
        let seq = self.inner_seq;
        self.inner_seq = self.inner_seq.wrapping_add(1);
        seq
    }

    /// Record the auth id from a successful login.
    pub fn accept(&mut self, auth_id: AuthId) {
        self.auth_id = auth_id;
        self.authenticated = true;
    }

    /// Replace the auth id with the one issued in a stream grant.
    pub fn refresh(&mut self, auth_id: AuthId) {
        self.auth_id = auth_id;
    }

    pub fn auth_id(&self) -> &AuthId {
        &self.auth_id
    }

    /// Whether a login ever succeeded in this session.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}
