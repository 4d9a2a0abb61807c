//! Exclusive lease: TTL-bounded, single-owner mutual exclusion on a store key.
//!
//! [ExclusiveLease::try_obtain] writes a random token with `SET NX` and a TTL, so a
//! holder that dies simply lets the lease expire. Release is compare-and-delete
//! on the token: a holder whose lease already expired cannot release the lease
//! of whoever obtained it next.

use std::time::Duration;

use tracing::debug;

use crate::error::StoreError;
use crate::script::Script;
use crate::store::SharedStore;

pub const EXCLUSIVE_LEASE_PREFIX: &str = "exclusive_lease";

/// Proof of ownership returned by a successful [ExclusiveLease::try_obtain].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone)]
pub struct ExclusiveLease {
    store: SharedStore,
    key: String,
    ttl: Duration,
}

impl ExclusiveLease {
    pub fn new(store: SharedStore, key: impl AsRef<str>, ttl: Duration) -> Self {
        Self {
            store,
            key: format!("{EXCLUSIVE_LEASE_PREFIX}:{}", key.as_ref()),
            ttl,
        }
    }

    /// Fully qualified store key of the lease.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a token when the lease was free, `None` when someone else holds it.
    pub fn try_obtain(&self) -> Result<Option<LeaseToken>, StoreError> {
        let token = uuid::Uuid::new_v4().to_string();
        if self.store.set_nx(&self.key, &token, self.ttl)? {
            Ok(Some(LeaseToken(token)))
        } else {
            Ok(None)
        }
    }

    /// Release the lease if `token` still owns it. Returns true when released.
    pub fn cancel(&self, token: &LeaseToken) -> Result<bool, StoreError> {
        let released = self.store.eval(&Script::CompareAndDelete {
            key: self.key.clone(),
            expected: token.0.clone(),
        })?;
        Ok(released == 1)
    }

    pub fn exists(&self) -> Result<bool, StoreError> {
        self.store.exists(&self.key)
    }

    /// Time left before the lease frees itself.
    pub fn remaining(&self) -> Result<Option<Duration>, StoreError> {
        self.store.pttl(&self.key)
    }
}

/// Run `f` while holding `lease`.
///
/// Returns `Ok(None)` without running `f` when the lease is held elsewhere. The
/// lease is released after `f` whether it succeeded or failed; a failure to
/// release never masks the error from `f`.
pub fn in_lock<T, E, F>(lease: &ExclusiveLease, f: F) -> Result<Option<T>, E>
where
    E: From<StoreError>,
    F: FnOnce() -> Result<T, E>,
{
    let Some(token) = lease.try_obtain()? else {
        debug!(lease = lease.key(), "exclusive lease already taken");
        return Ok(None);
    };
    let outcome = f();
    let released = lease.cancel(&token);
    match (outcome, released) {
        (Ok(value), Ok(_)) => Ok(Some(value)),
        (Ok(_), Err(err)) => Err(err.into()),
        (Err(err), _) => Err(err),
    }
}
