use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use base64::Engine;
use parking_lot::RwLock;
use tracing::debug;

use super::principal::Principal;

pub type SessionToken = String;

#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub principal: Arc<Principal>,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

fn gen_token() -> Result<String> {
    // 256-bit random token, base64url without padding
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).context("OS random source unavailable for session token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

/// Bearer-token registry standing in for the external authentication service.
#[derive(Clone)]
pub struct SessionManager {
    pub ttl: Duration,
    sessions: Arc<RwLock<HashMap<SessionToken, Session>>>,
}

impl Default for SessionManager {
    fn default() -> Self { Self::new(Duration::from_secs(60 * 60)) }
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, sessions: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn issue(&self, principal: Principal) -> Result<Session> {
        Ok(self.issue_with_token(principal, gen_token()?))
    }

    /// Register a session under a caller-chosen token (identity seeding).
    pub fn issue_with_token(&self, principal: Principal, token: SessionToken) -> Session {
        let now = Instant::now();
        let user_id = principal.user_id.clone();
        let sess = Session { token: token.clone(), principal: Arc::new(principal), issued_at: now, expires_at: now + self.ttl };
        self.sessions.write().insert(token, sess.clone());
        debug!(target: "kvgate::session", user = %user_id, ttl_secs = self.ttl.as_secs(), "session.issue");
        sess
    }

    /// Principal for a live token; expired tokens are dropped on sight.
    pub fn validate(&self, token: &str) -> Option<Arc<Principal>> {
        let now = Instant::now();
        {
            let map = self.sessions.read();
            match map.get(token) {
                Some(s) if s.expires_at > now => return Some(s.principal.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.logout(token);
        None
    }

    pub fn logout(&self, token: &str) -> bool {
        self.sessions.write().remove(token).is_some()
    }

    pub fn revoke_all(&self) -> usize {
        let mut s = self.sessions.write();
        let n = s.len();
        s.clear();
        n
    }

    pub fn active(&self) -> usize { self.sessions.read().len() }
}
