//! Fixed-window request limiter keyed by client address.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Windows are tracked per key; a key's window restarts on its first request after expiry.
#[derive(Clone)]
pub struct RateLimiter {
    window: Duration,
    limit: u32,
    max_keys: usize,
    buckets: Arc<Mutex<HashMap<IpAddr, Window>>>,
}

#[derive(Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    /// `limit == 0` disables limiting.
    pub fn new(window: Duration, limit: u32, max_keys: usize) -> Self {
        Self { window, limit, max_keys: max_keys.max(1), buckets: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn disabled() -> Self { Self::new(Duration::from_secs(1), 0, 1) }

    /// Count one request for `key`; false once the key exceeded its quota this window.
    pub fn allow(&self, key: IpAddr) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: IpAddr, now: Instant) -> bool {
        if self.limit == 0 { return true; }
        let mut b = self.buckets.lock();
        if b.len() >= self.max_keys && !b.contains_key(&key) {
            let window = self.window;
            b.retain(|_, w| now.duration_since(w.started) < window);
            if b.len() >= self.max_keys {
                // Nothing expired: drop the oldest window to stay within capacity.
                let oldest = b.iter().min_by_key(|(_, w)| w.started).map(|(k, _)| *k);
                if let Some(k) = oldest { b.remove(&k); }
            }
        }
        let w = b.entry(key).or_insert(Window { started: now, count: 0 });
        if now.duration_since(w.started) >= self.window {
            *w = Window { started: now, count: 0 };
        }
        if w.count >= self.limit { return false; }
        w.count += 1;
        true
    }

    pub fn tracked(&self) -> usize { self.buckets.lock().len() }
}
