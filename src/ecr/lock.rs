//! Per-device advisory lock.
//!
//! A logical operation (a whole check, a shift close) takes the lock once
//! under an [`OwnerToken`] and keeps it across every command it issues.
//! A holder older than the staleness timeout is evicted on the next
//! acquire attempt. [`DeviceLock::release`] clears any holder so an
//! operator can recover a device after an aborted workflow; owners release
//! through [`DeviceLock::release_if`].

use crate::ecr::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(Uuid);

impl OwnerToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OwnerToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(OwnerToken)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockPolicy {
    /// Holders older than this are evicted.
    pub max_busy: Duration,
    /// Polling schedule for blocking acquisition.
    pub retry: RetryPolicy,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_busy: Duration::from_secs(60),
            retry: RetryPolicy::fixed(10, Duration::from_millis(1000)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Fresh,
    Reentrant,
    /// Took over from a stale holder.
    Evicted(OwnerToken),
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: OwnerToken,
    since: Instant,
}

#[derive(Debug, Default)]
pub struct DeviceLock {
    holder: Option<Holder>,
}

impl DeviceLock {
    /// Take the lock for `token`. On refusal returns the current holder.
    pub fn acquire(
        &mut self,
        token: OwnerToken,
        now: Instant,
        max_busy: Duration,
    ) -> Result<Acquired, OwnerToken> {
        let evicted = self.evict_stale(now, max_busy);
        match self.holder {
            Some(h) if h.token == token => Ok(Acquired::Reentrant),
            Some(h) => Err(h.token),
            None => {
                self.holder = Some(Holder { token, since: now });
                Ok(evicted.map_or(Acquired::Fresh, Acquired::Evicted))
            }
        }
    }

    /// Clear the lock regardless of who holds it.
    pub fn release(&mut self) -> Option<OwnerToken> {
        self.holder.take().map(|h| h.token)
    }

    /// Clear the lock only if `token` holds it.
    pub fn release_if(&mut self, token: OwnerToken) -> bool {
        match self.holder {
            Some(h) if h.token == token => {
                self.holder = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the holder if it has exceeded `max_busy`.
    pub fn evict_stale(&mut self, now: Instant, max_busy: Duration) -> Option<OwnerToken> {
        match self.holder {
            Some(h) if now.saturating_duration_since(h.since) > max_busy => {
                self.holder = None;
                Some(h.token)
            }
            _ => None,
        }
    }

    pub fn holder(&self) -> Option<OwnerToken> {
        self.holder.map(|h| h.token)
    }

    pub fn is_busy(&self) -> bool {
        self.holder.is_some()
    }

    pub fn held_for(&self, now: Instant) -> Option<Duration> {
        self.holder.map(|h| now.saturating_duration_since(h.since))
    }
}
