//! Port pool: a fixed set of slots, each mapping to a deterministic
//! backend/frontend port pair.
//!
//! Slot `i` always yields `base_backend + 2i` and `base_frontend + 2i`, so two
//! slots reserved at the same time never share a port, and re-reserving a
//! released slot gives back the same pair. Claims are single conditional
//! updates in the store, which keeps concurrent reservations race-free.

use tracing::{debug, info};

use crate::config::PortsSection;
use crate::errors::OrchestrationError;
use crate::store::{DbHandle, PortPair, PortSlot};

/// Compute the port pair for a slot.
pub fn ports_for_slot(config: &PortsSection, slot_index: u32) -> Result<PortPair, OrchestrationError> {
    let offset = 2 * u64::from(slot_index);
    let backend = u64::from(config.base_backend) + offset;
    let frontend = u64::from(config.base_frontend) + offset;
    match (u16::try_from(backend), u16::try_from(frontend)) {
        (Ok(backend), Ok(frontend)) => Ok(PortPair { backend, frontend }),
        _ => Err(anyhow::anyhow!("slot {} maps outside the valid port range", slot_index).into()),
    }
}

#[derive(Clone)]
pub struct PortPool {
    db: DbHandle,
    config: PortsSection,
}

impl PortPool {
    /// Create the pool, seeding any missing slots.
    pub async fn new(db: DbHandle, config: PortsSection) -> anyhow::Result<Self> {
        let capacity = config.capacity;
        db.call(move |db| db.ensure_port_slots(capacity)).await?;
        Ok(Self { db, config })
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    /// Reserve the first free slot for `execution_id`.
    ///
    /// Reserving again with the same id returns the slot it already holds.
    pub async fn reserve(&self, execution_id: &str) -> Result<PortPair, OrchestrationError> {
        let id = execution_id.to_string();
        let capacity = self.config.capacity;
        let slot = self
            .db
            .call(move |db| db.claim_port_slot(&id, capacity))
            .await?;
        match slot {
            Some(slot_index) => {
                let pair = ports_for_slot(&self.config, slot_index)?;
                debug!(execution_id, slot_index, backend = pair.backend, frontend = pair.frontend, "Reserved port slot");
                Ok(pair)
            }
            None => {
                info!(execution_id, capacity, "Port pool exhausted");
                Err(OrchestrationError::ResourceExhausted {
                    pool: "port",
                    capacity,
                })
            }
        }
    }

    /// Free the slot held by `execution_id`. Returns false when it held none.
    pub async fn release(&self, execution_id: &str) -> anyhow::Result<bool> {
        let id = execution_id.to_string();
        let released = self.db.call(move |db| db.release_port_slot(&id)).await?;
        if released {
            debug!(execution_id, "Released port slot");
        }
        Ok(released)
    }

    pub async fn slots(&self) -> anyhow::Result<Vec<PortSlot>> {
        self.db.call(|db| db.list_port_slots()).await
    }
}
