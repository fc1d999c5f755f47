//! Pass leases
//!
//! A lease is a time-bound mutual-exclusion token held for the duration of
//! one pass so overlapping scheduler invocations never process the same row
//! concurrently. A holder that dies without releasing simply lets the lease
//! expire.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A granted lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Who holds the lease
    pub owner: String,
    /// Unique token for this grant
    pub token: String,
    /// When the lease was granted
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses if not released
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Grant a new lease to `owner` valid for `ttl` from `now`
    pub fn grant(owner: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());

        Self {
            owner: owner.to_string(),
            token: format!("{}-{:x}", owner, nanos),
            acquired_at: now,
            expires_at,
        }
    }

    /// The same grant extended to `now + ttl`
    pub fn renewed(&self, ttl: Duration, now: DateTime<Utc>) -> Self {
        let extended = Self::grant(&self.owner, ttl, now);
        Self {
            owner: self.owner.clone(),
            token: self.token.clone(),
            acquired_at: self.acquired_at,
            expires_at: extended.expires_at,
        }
    }

    /// Whether the lease has lapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Grants and releases pass leases
#[async_trait]
pub trait LeaseProvider: Send + Sync {
    /// Acquire the lease, failing with `LeaseHeld` while another live lease exists
    async fn acquire(&self, owner: &str, ttl: Duration) -> Result<Lease>;

    /// Extend a held lease by `ttl` from now. Fails with `LeaseHeld` once the
    /// lease has been taken over by another owner.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    /// Release a lease; releasing a lease that was already taken over is a no-op
    async fn release(&self, lease: &Lease) -> Result<()>;
}

/// Default lease owner: `<hostname>:<pid>`
pub fn default_lease_owner() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}
