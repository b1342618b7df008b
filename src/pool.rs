//! Bounded, reusable pool of browser sessions.
//!
//! Two limits apply: at most `idle_capacity` sessions wait for reuse, and at
//! most `max_live` sessions exist at all (idle plus checked out). Every live
//! session carries one permit of the admission gate, so the ceiling holds no
//! matter how sessions move between the idle list and callers.

use nanoid::nanoid;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::session::{BrowserSession, DispatchError, SessionFactory};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to start browser session: {0}")]
    Launch(#[from] DispatchError),
    #[error("browser pool is shut down")]
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub idle_capacity: usize,
    pub max_live: usize,
}

/// A checked-out session. Hand it back with [`BrowserPool::release`] or
/// [`BrowserPool::discard`]; dropping it frees the slot without closing.
pub struct PooledSession<S> {
    session: S,
    id: String,
    _permit: OwnedSemaphorePermit,
}

impl<S> PooledSession<S> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<S> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

pub struct BrowserPool<F: SessionFactory> {
    factory: F,
    idle: Mutex<Vec<PooledSession<F::Session>>>,
    gate: Arc<Semaphore>,
    returned: Notify,
    cfg: PoolConfig,
}

impl<F: SessionFactory> BrowserPool<F> {
    pub fn new(factory: F, cfg: PoolConfig) -> Self {
        let max_live = cfg.max_live.max(1);
        let idle_capacity = if cfg.idle_capacity > max_live {
            warn!(idle = cfg.idle_capacity, max_live, "idle capacity above live ceiling, clamping");
            max_live
        } else {
            cfg.idle_capacity
        };
        Self {
            factory,
            idle: Mutex::new(Vec::with_capacity(idle_capacity)),
            gate: Arc::new(Semaphore::new(max_live)),
            returned: Notify::new(),
            cfg: PoolConfig { idle_capacity, max_live },
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.cfg
    }

    /// Sessions currently alive, idle or checked out.
    pub fn live(&self) -> usize {
        self.cfg.max_live - self.gate.available_permits()
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Reuses an idle session if there is one, otherwise launches a new one
    /// when under the live ceiling, otherwise waits for either to happen.
    pub async fn acquire(&self) -> Result<PooledSession<F::Session>, PoolError> {
        loop {
            if let Some(s) = self.idle.lock().await.pop() {
                debug!(session = %s.id, "reusing idle browser session");
                return Ok(s);
            }
            let returned = self.returned.notified();
            tokio::pin!(returned);
            returned.as_mut().enable();
            // Re-check after registering so a concurrent release is not missed.
            if let Some(s) = self.idle.lock().await.pop() {
                debug!(session = %s.id, "reusing idle browser session");
                return Ok(s);
            }
            tokio::select! {
                permit = self.gate.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| PoolError::Closed)?;
                    let session = self.factory.create().await?;
                    let id = nanoid!(8);
                    info!(session = %id, live = self.live(), "started browser session");
                    return Ok(PooledSession { session, id, _permit: permit });
                }
                _ = &mut returned => continue,
            }
        }
    }

    /// Returns a healthy session for reuse, or closes it when the idle list
    /// is full.
    pub async fn release(&self, session: PooledSession<F::Session>) {
        let overflow = {
            let mut idle = self.idle.lock().await;
            if !self.gate.is_closed() && idle.len() < self.cfg.idle_capacity {
                debug!(session = %session.id, idle = idle.len() + 1, "browser session back in pool");
                idle.push(session);
                None
            } else {
                Some(session)
            }
        };
        match overflow {
            None => self.returned.notify_one(),
            Some(session) => Self::close_quietly(session).await,
        }
    }

    /// Closes a session that should not be reused.
    pub async fn discard(&self, session: PooledSession<F::Session>) {
        Self::close_quietly(session).await;
    }

    /// Closes all idle sessions and refuses new launches.
    pub async fn shutdown(&self) {
        self.gate.close();
        let drained: Vec<_> = self.idle.lock().await.drain(..).collect();
        for s in drained {
            Self::close_quietly(s).await;
        }
    }

    /// Close failures are logged and swallowed so they never mask the
    /// caller's own outcome.
    async fn close_quietly(mut session: PooledSession<F::Session>) {
        if let Err(e) = session.session.close().await {
            warn!(session = %session.id, error = %e, "closing browser session failed");
        } else {
            debug!(session = %session.id, "closed browser session");
        }
    }
}
