//! Recorded topology declarations
//!
//! Every exchange, queue and binding declared through the client is kept
//! here so that it can be replayed against a fresh connection after a
//! reconnect. Replay order is exchanges, then queues, then bindings.

use crate::transport::Session;
use crate::types::{BindDef, ExchangeDef, QueueDef};
use crate::Result;

/// Declarations made so far, in declaration order
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchanges: Vec<ExchangeDef>,
    queues: Vec<QueueDef>,
    bindings: Vec<BindDef>,
}

impl Topology {
    /// Empty topology
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an exchange (re-declaring the same name replaces the definition)
    pub fn record_exchange(&mut self, def: ExchangeDef) {
        match self.exchanges.iter_mut().find(|e| e.name == def.name) {
            Some(existing) => *existing = def,
            None => self.exchanges.push(def),
        }
    }

    /// Record a queue
    pub fn record_queue(&mut self, def: QueueDef) {
        match self.queues.iter_mut().find(|q| q.name == def.name) {
            Some(existing) => *existing = def,
            None => self.queues.push(def),
        }
    }

    /// Record a binding (identical bindings are kept once)
    pub fn record_binding(&mut self, def: BindDef) {
        if !self.bindings.contains(&def) {
            self.bindings.push(def);
        }
    }

    /// Declared exchanges
    pub fn exchanges(&self) -> &[ExchangeDef] {
        &self.exchanges
    }

    /// Declared queues
    pub fn queues(&self) -> &[QueueDef] {
        &self.queues
    }

    /// Declared bindings
    pub fn bindings(&self) -> &[BindDef] {
        &self.bindings
    }

    /// Nothing declared yet
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    /// Re-declare everything on `session`
    pub async fn replay(&self, session: &dyn Session) -> Result<()> {
        for exchange in &self.exchanges {
            session.declare_exchange(exchange).await?;
        }
        for queue in &self.queues {
            session.declare_queue(queue).await?;
        }
        for binding in &self.bindings {
            session.bind(binding).await?;
        }
        Ok(())
    }
}
