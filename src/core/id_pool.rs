//! Id pools
//!
//! Lowest-free allocators over an inclusive range. Used for device ids
//! (which exclude the SVC and host ids) and for host cports.

use super::error::{BusError, BusResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Device id of the SVC
pub const DEVICE_ID_SVC: u8 = 0;
/// Device id of the host
pub const DEVICE_ID_HOST: u8 = 1;
/// First device id handed to modules
pub const DEVICE_ID_FIRST: u8 = 2;
/// Marks "no device id"
pub const DEVICE_ID_INVALID: u8 = 0xff;

/// Allocator over `first..=last`
#[derive(Debug)]
pub struct IdPool {
    name: &'static str,
    first: u16,
    last: u16,
    used: Mutex<BTreeSet<u16>>,
}

impl IdPool {
    /// Create a pool covering `first..=last`
    pub fn new(name: &'static str, first: u16, last: u16) -> Self {
        Self {
            name,
            first,
            last,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Pool of module device ids: `first..=last`, never the SVC, host or invalid ids
    pub fn device_ids(first: u8, last: u8) -> Self {
        let first = first.max(DEVICE_ID_FIRST);
        let last = last.min(DEVICE_ID_INVALID - 1);
        Self::new("device id", u16::from(first), u16::from(last))
    }

    /// Take the lowest free id
    pub fn allocate(&self) -> BusResult<u16> {
        if self.first > self.last {
            return Err(BusError::ResourceExhausted(format!("{} pool is empty", self.name)));
        }

        let mut used = self.used.lock();
        let mut candidate = u32::from(self.first);

        // `used` is sorted, so the first gap is the lowest free id
        for id in used.range(self.first..=self.last) {
            if u32::from(*id) != candidate {
                break;
            }
            candidate += 1;
        }

        if candidate > u32::from(self.last) {
            return Err(BusError::ResourceExhausted(format!(
                "{} pool {}..={} exhausted",
                self.name, self.first, self.last
            )));
        }

        let id = candidate as u16;
        used.insert(id);
        Ok(id)
    }

    /// Take a specific id
    pub fn reserve(&self, id: u16) -> BusResult<()> {
        if id < self.first || id > self.last {
            return Err(BusError::NotFound(format!("{} {} outside pool", self.name, id)));
        }
        if !self.used.lock().insert(id) {
            return Err(BusError::AlreadyExists(format!("{} {}", self.name, id)));
        }
        Ok(())
    }

    /// Return an id; false if it was not allocated
    pub fn release(&self, id: u16) -> bool {
        self.used.lock().remove(&id)
    }

    /// Is the id allocated?
    pub fn is_allocated(&self, id: u16) -> bool {
        self.used.lock().contains(&id)
    }

    /// Number of allocated ids
    pub fn in_use(&self) -> usize {
        self.used.lock().len()
    }

    /// Total ids in the pool
    pub fn capacity(&self) -> usize {
        if self.first > self.last {
            0
        } else {
            usize::from(self.last - self.first) + 1
        }
    }
}
