//! per client admission control

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::config::RateLimitConfig;

/// Token bucket algorithm
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        TokenBucket {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let tokens_to_add = elapsed * self.refill_rate;

        self.tokens = (self.tokens + tokens_to_add).min(self.max_tokens);
        self.last_refill = now;
    }

    /// Takes one token if one is available.
    pub fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Keys that bypass rate limiting entirely
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    keys: HashSet<String>,
}

impl Whitelist {
    /// Parses a comma separated list. Blank entries are dropped so that an
    /// empty key can never match.
    pub fn from_csv(list: &str) -> Whitelist {
        let keys = list
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();

        Whitelist { keys }
    }

    pub fn contains(&self, key: Option<&str>) -> bool {
        match key {
            Some(key) => self.keys.contains(key),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// One token bucket per client address
pub struct IpRateLimiter {
    whitelist: Whitelist,
    max_tokens: f64,
    refill_rate: f64,
    buckets: RwLock<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl IpRateLimiter {
    pub fn new(whitelist: Whitelist, max_tokens: f64, refill_rate: f64) -> IpRateLimiter {
        IpRateLimiter {
            whitelist,
            max_tokens,
            refill_rate,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Admits or denies one request from `ip`.
    ///
    /// The first request from an address always passes. Two threads seeing
    /// the same new address at once may each create and insert a bucket; the
    /// last insert wins, so such a client can get a few extra requests
    /// through. Existing buckets are only ever touched under the read lock.
    pub fn admit(&self, ip: &str, key: Option<&str>) -> bool {
        if self.whitelist.contains(key) {
            return true;
        }

        let existing = self.buckets.read().get(ip).cloned();
        if let Some(bucket) = existing {
            return bucket.lock().try_take();
        }

        let mut bucket = TokenBucket::new(self.max_tokens, self.refill_rate);
        bucket.try_take();
        self.buckets
            .write()
            .insert(ip.to_string(), Arc::new(Mutex::new(bucket)));

        true
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.read().len()
    }
}

pub enum RateLimiter {
    Disabled,
    PerIp(IpRateLimiter),
}

impl RateLimiter {
    pub fn from_config(config: &RateLimitConfig) -> RateLimiter {
        if !config.enabled {
            return RateLimiter::Disabled;
        }

        RateLimiter::PerIp(IpRateLimiter::new(
            Whitelist::from_csv(&config.key_whitelist),
            config.max_tokens,
            config.recover_x_tokens_per_sec,
        ))
    }

    pub fn admit(&self, ip: &str, key: Option<&str>) -> bool {
        match *self {
            RateLimiter::Disabled => true,
            RateLimiter::PerIp(ref limiter) => limiter.admit(ip, key),
        }
    }
}
