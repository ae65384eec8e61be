//! Named event rings
//!
//! Host-side producers push events; controllers poll them out. Each ring is
//! a bounded FIFO that drops its oldest entry on overflow, so a slow
//! controller loses history instead of stalling the host.

use crate::traits::MemoryAccess;
use nexus_common::protocol::{EventRecord, MAX_EVENT_PAYLOAD, MAX_NAME_LEN};
use nexus_common::ticks::tick_ms;
use nexus_common::{debug, Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Capacity used when a registration asks for zero.
pub const DEFAULT_RING_CAPACITY: usize = 100;

struct EventRing {
    address: usize,
    size: usize,
    capacity: usize,
    queue: VecDeque<EventRecord>,
}

#[derive(Default)]
pub struct EventRings {
    rings: Mutex<HashMap<String, EventRing>>,
}

impl EventRings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a named ring backed by controller-visible
    /// memory at `address`.
    pub fn register(
        &self,
        memory: &dyn MemoryAccess,
        name: &str,
        address: usize,
        size: usize,
        capacity: u32,
    ) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || address == 0 || size == 0 {
            return Err(Error::InvalidArgument(
                "Invalid event buffer parameters".into(),
            ));
        }

        memory.probe_committed(address)?;

        let capacity = if capacity == 0 {
            DEFAULT_RING_CAPACITY
        } else {
            capacity as usize
        };

        debug!(target: "nexus_core::events", name = %name, address = format!("{:#x}", address), capacity, "Registered event ring");

        self.rings.lock().insert(
            name.to_string(),
            EventRing {
                address,
                size,
                capacity,
                queue: VecDeque::new(),
            },
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        match self.rings.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("Event buffer '{}'", name))),
        }
    }

    /// Enqueue an event from host-side code. Returns false when the ring
    /// does not exist (producers fire blindly and must not error).
    pub fn push(&self, name: &str, id: u32, data: &[u8]) -> bool {
        let mut rings = self.rings.lock();
        let Some(ring) = rings.get_mut(name) else {
            return false;
        };

        let len = data.len().min(MAX_EVENT_PAYLOAD);
        ring.queue.push_back(EventRecord {
            id,
            timestamp: tick_ms(),
            data: data[..len].to_vec(),
        });

        while ring.queue.len() > ring.capacity {
            ring.queue.pop_front();
        }
        true
    }

    /// Pop up to `max` pending events.
    pub fn poll(&self, name: &str, max: usize) -> Result<Vec<EventRecord>> {
        let mut rings = self.rings.lock();
        let ring = rings
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("Event buffer '{}'", name)))?;

        let count = ring.queue.len().min(max);
        Ok(ring.queue.drain(..count).collect())
    }

    /// Registered buffer location, for host-side producers.
    pub fn buffer_of(&self, name: &str) -> Option<(usize, usize)> {
        self.rings.lock().get(name).map(|r| (r.address, r.size))
    }

    pub fn len(&self) -> usize {
        self.rings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.lock().is_empty()
    }

    pub fn clear(&self) {
        self.rings.lock().clear();
    }
}
