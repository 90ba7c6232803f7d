//! Single-instance lock for the ingester.
//!
//! A lock is a named lease held under a random token. The holder renews the
//! lease in the background and must release it explicitly; a crashed holder's
//! lease simply expires.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Backend able to hold named leases.
#[async_trait]
pub trait InstanceLock: Send + Sync {
    /// Takes `name` for `token` if nobody holds it. Returns false when held.
    async fn try_acquire(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Extends the lease if `token` still holds `name`.
    async fn renew(&self, name: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Frees `name` if `token` still holds it.
    async fn release(&self, name: &str, token: &str) -> Result<bool>;
}

/// Held lock. Release with [`LockGuard::release`]; dropping without
/// releasing leaves the lease to expire.
pub struct LockGuard {
    backend: Arc<dyn InstanceLock>,
    name: String,
    token: String,
    lost: Arc<Notify>,
    renewer: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    /// Tries once to take the lock. `Ok(None)` means another instance holds it.
    pub async fn acquire(
        backend: Arc<dyn InstanceLock>,
        name: &str,
        lease: Duration,
    ) -> Result<Option<Self>> {
        let token = Uuid::new_v4().to_string();
        if !backend.try_acquire(name, &token, lease).await? {
            return Ok(None);
        }

        info!(lock = %name, "acquired instance lock");
        let lost = Arc::new(Notify::new());
        let renewer = tokio::spawn(renew_loop(
            backend.clone(),
            name.to_string(),
            token.clone(),
            lease,
            lost.clone(),
        ));

        Ok(Some(Self {
            backend,
            name: name.to_string(),
            token,
            lost,
            renewer: Some(renewer),
            released: false,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Notified once when a renewal finds the lock taken by someone else.
    pub fn lost_signal(&self) -> Arc<Notify> {
        self.lost.clone()
    }

    /// Stops renewing and frees the lock. Safe to call more than once.
    pub async fn release(&mut self) -> Result<bool> {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
        if self.released {
            return Ok(false);
        }
        self.released = true;

        let freed = self.backend.release(&self.name, &self.token).await?;
        if freed {
            info!(lock = %self.name, "released instance lock");
        } else {
            warn!(lock = %self.name, "lock was no longer held at release");
        }
        Ok(freed)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
        if !self.released {
            warn!(lock = %self.name, "lock guard dropped without release, lease will expire");
        }
    }
}

async fn renew_loop(
    backend: Arc<dyn InstanceLock>,
    name: String,
    token: String,
    lease: Duration,
    lost: Arc<Notify>,
) {
    let period = (lease / 3).max(Duration::from_millis(50));
    let mut ticker = tokio::time::interval(period);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match backend.renew(&name, &token, lease).await {
            Ok(true) => debug!(lock = %name, "renewed lock lease"),
            Ok(false) => {
                error!(lock = %name, "lock lease lost to another holder");
                lost.notify_one();
                return;
            }
            Err(err) => warn!(lock = %name, error = %err, "failed to renew lock lease"),
        }
    }
}
