//! Session pool
//!
//! Holds up to `capacity` idle sessions on the current connection.
//! `get` hands out an open session, opening a fresh one when the pool is
//! empty or the pooled session has been closed underneath us. `put` returns
//! a session, closing it instead when it is no longer open or the pool is
//! already full.

use crate::metrics::POOL_IDLE_SESSIONS;
use crate::transport::{Connection, Session};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pool of reusable sessions
pub struct SessionPool {
    idle: Mutex<VecDeque<Box<dyn Session>>>,
    capacity: usize,
    connection: RwLock<Option<Arc<dyn Connection>>>,
}

impl SessionPool {
    /// Create an empty pool; sessions are opened once a connection is installed
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            connection: RwLock::new(None),
        }
    }

    /// Pool capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Idle sessions currently pooled
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Connection sessions are opened on
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.connection.read().clone()
    }

    /// Take an open session
    pub async fn get(&self) -> Result<Box<dyn Session>> {
        loop {
            let pooled = self.idle.lock().pop_front();
            match pooled {
                Some(session) if session.is_open() => {
                    self.report();
                    return Ok(session);
                }
                Some(stale) => {
                    debug!("Discarding closed pooled session");
                    stale.close().await;
                }
                None => break,
            }
        }
        self.report();
        self.open().await
    }

    /// Return a session
    pub async fn put(&self, session: Box<dyn Session>) {
        if !session.is_open() {
            session.close().await;
            return;
        }

        let overflow = {
            let mut idle = self.idle.lock();
            if idle.len() < self.capacity {
                idle.push_back(session);
                None
            } else {
                Some(session)
            }
        };
        if let Some(session) = overflow {
            session.close().await;
        }
        self.report();
    }

    /// Install `connection` and refill the pool from it, closing old sessions
    pub async fn rebuild(&self, connection: Arc<dyn Connection>) -> Result<()> {
        *self.connection.write() = Some(connection.clone());

        let stale: Vec<_> = self.idle.lock().drain(..).collect();
        for session in stale {
            session.close().await;
        }

        let mut fresh = Vec::with_capacity(self.capacity);
        for _ in 0..self.capacity {
            match connection.open_session().await {
                Ok(session) => fresh.push(session),
                Err(e) => {
                    warn!("Failed to open pooled session: {}", e);
                    break;
                }
            }
        }
        let opened = fresh.len();
        self.idle.lock().extend(fresh);
        self.report();

        if opened == 0 {
            return Err(Error::Connection("could not open any session".into()));
        }
        debug!("Session pool rebuilt with {} sessions", opened);
        Ok(())
    }

    /// Close every idle session and forget the connection
    pub async fn drain(&self) {
        *self.connection.write() = None;
        let stale: Vec<_> = self.idle.lock().drain(..).collect();
        for session in stale {
            session.close().await;
        }
        self.report();
    }

    async fn open(&self) -> Result<Box<dyn Session>> {
        let connection = self
            .connection()
            .ok_or_else(|| Error::Connection("not connected".into()))?;
        if connection.is_closed() {
            return Err(Error::Connection("connection is closed".into()));
        }
        connection.open_session().await
    }

    fn report(&self) {
        POOL_IDLE_SESSIONS.set(self.idle.lock().len() as i64);
    }
}
