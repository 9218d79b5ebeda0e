//! Per-VM /30 subnet accounting.
//!
//! A monotonic counter carves non-overlapping /30s out of one /16 pool:
//! slot `i` covers `base.(i*4 >> 8).(i*4 & 0xff)/30`, host takes `.1`,
//! guest `.2`. After 16384 slots the pool is exhausted and allocation fails;
//! slots are never reused within a daemon lifetime.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use aegis_shared::errors::{AegisError, AegisResult};

/// Number of /30s in a /16.
pub const MAX_SLOTS: u32 = 16384;

/// One allocated /30.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetSlot {
    pool: [u8; 2],
    pub index: u16,
}

impl SubnetSlot {
    pub fn new(pool: [u8; 2], index: u16) -> Self {
        Self { pool, index }
    }

    fn octets(&self, offset: u8) -> Ipv4Addr {
        let base = u32::from(self.index) * 4;
        Ipv4Addr::new(
            self.pool[0],
            self.pool[1],
            (base >> 8) as u8,
            (base & 0xff) as u8 + offset,
        )
    }

    /// Network address with prefix, e.g. `10.177.0.8/30`.
    pub fn cidr(&self) -> String {
        format!("{}/30", self.octets(0))
    }

    pub fn host_ip(&self) -> Ipv4Addr {
        self.octets(1)
    }

    pub fn guest_ip(&self) -> Ipv4Addr {
        self.octets(2)
    }

    /// Tap device name for this slot (`aegis<N>`).
    pub fn tap_name(&self) -> String {
        format!("aegis{}", self.index)
    }
}

/// Monotonic slot allocator.
pub struct SubnetAllocator {
    pool: [u8; 2],
    next: AtomicU32,
}

impl SubnetAllocator {
    pub fn new(pool: [u8; 2]) -> Self {
        Self {
            pool,
            next: AtomicU32::new(0),
        }
    }

    pub fn allocate(&self) -> AegisResult<SubnetSlot> {
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        if index >= MAX_SLOTS {
            // Park the counter so it cannot wrap.
            self.next.store(MAX_SLOTS, Ordering::SeqCst);
            return Err(AegisError::ResourceExhausted(format!(
                "subnet pool {}.{}.0.0/16 exhausted ({MAX_SLOTS} slots)",
                self.pool[0], self.pool[1]
            )));
        }
        Ok(SubnetSlot::new(self.pool, index as u16))
    }

    /// Skip past a slot seen in the registry, so recovery never re-issues a
    /// /30 an old row still references.
    pub fn advance_past(&self, index: u16) {
        let floor = u32::from(index) + 1;
        self.next.fetch_max(floor, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_do_not_overlap() {
        let alloc = SubnetAllocator::new([10, 177]);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!(a.cidr(), "10.177.0.0/30");
        assert_eq!(a.host_ip(), Ipv4Addr::new(10, 177, 0, 1));
        assert_eq!(a.guest_ip(), Ipv4Addr::new(10, 177, 0, 2));
        assert_eq!(b.cidr(), "10.177.0.4/30");
        assert_eq!(a.tap_name(), "aegis0");
        assert_eq!(b.tap_name(), "aegis1");
    }

    #[test]
    fn slot_index_crosses_octet_boundary() {
        let slot = SubnetSlot::new([10, 177], 64);
        assert_eq!(slot.cidr(), "10.177.1.0/30");
        assert_eq!(slot.host_ip(), Ipv4Addr::new(10, 177, 1, 1));
    }

    #[test]
    fn pool_exhaustion_fails() {
        let alloc = SubnetAllocator::new([10, 177]);
        alloc.next.store(MAX_SLOTS - 1, Ordering::SeqCst);
        let last = alloc.allocate().unwrap();
        assert_eq!(u32::from(last.index), MAX_SLOTS - 1);
        assert!(matches!(
            alloc.allocate(),
            Err(AegisError::ResourceExhausted(_))
        ));
        // Still exhausted on retry.
        assert!(alloc.allocate().is_err());
    }

    #[test]
    fn advance_past_skips_recovered_slots() {
        let alloc = SubnetAllocator::new([10, 177]);
        alloc.advance_past(7);
        assert_eq!(alloc.allocate().unwrap().index, 8);
        // Advancing backwards never regresses the counter.
        alloc.advance_past(3);
        assert_eq!(alloc.allocate().unwrap().index, 9);
    }
}
