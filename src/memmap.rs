//! EPT fault resolution: promotes a cold guest-physical access to a mapped
//! KVM memory slot.
//!
//! Normal RAM is mapped once at boot by [`crate::boot`] and never faults
//! again. This module exists for guest-physical ranges that only become
//! meaningful once a device claims them (an MMIO window, device-owned
//! memory handed out via `HostOp::AllocFromGuest`) and so are deliberately
//! left unmapped until the first access.

use crate::bus::Bus;
use crate::kvm::{KvmError, VmFd};
use crate::messages::MessageMemRegion;

/// Answers one EPT/NPT fault by asking `bus_memregion` who owns the faulting
/// guest-physical page, then installing a KVM memory slot over the returned
/// range.
pub struct MemoryMapper {
    next_slot: u32,
}

impl MemoryMapper {
    pub fn new() -> Self {
        Self { next_slot: 1 }
    }

    /// Ask `bus_memregion` who owns the page containing `fault_addr`, without
    /// installing anything yet.
    pub fn claim_for(
        &self,
        memregion_bus: &mut Bus<MessageMemRegion>,
        fault_addr: u64,
    ) -> Option<MessageMemRegion> {
        let mut msg = MessageMemRegion {
            fault_addr,
            start_page: 0,
            page_count: 0,
            host_ptr: 0,
        };
        memregion_bus.send(&mut msg).then_some(msg)
    }

    /// Install a KVM memory slot covering a claimed range.
    pub fn install(&mut self, vm: &VmFd, claim: &MessageMemRegion) -> Result<(), KvmError> {
        let slot = self.next_slot;
        self.next_slot += 1;
        let guest_addr = claim.start_page * 4096;
        let size = claim.page_count * 4096;
        unsafe { vm.set_user_memory_region(slot, guest_addr, size, claim.host_ptr) }
    }

    /// Try to resolve a fault at `fault_addr`. Returns `true` if a mapping
    /// was installed (the caller should resume the guest); `false` if no
    /// device claimed the page (the caller falls back to MMIO emulation).
    pub fn handle_fault(
        &mut self,
        vm: &VmFd,
        memregion_bus: &mut Bus<MessageMemRegion>,
        fault_addr: u64,
    ) -> Result<bool, KvmError> {
        match self.claim_for(memregion_bus, fault_addr) {
            Some(claim) => {
                self.install(vm, &claim)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for MemoryMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declines_when_no_owner_claims_the_page() {
        let mut mapper = MemoryMapper::new();
        let mut bus: Bus<MessageMemRegion> = Bus::new();
        bus.add(|_msg: &mut MessageMemRegion| false);

        let mut msg = MessageMemRegion {
            fault_addr: 0x12000,
            start_page: 0,
            page_count: 0,
            host_ptr: 0,
        };
        assert!(!bus.send(&mut msg));
    }

    #[test]
    fn owner_claim_reports_the_requested_range() {
        let mut bus: Bus<MessageMemRegion> = Bus::new();
        bus.add(|msg: &mut MessageMemRegion| {
            msg.start_page = msg.fault_addr >> 12;
            msg.page_count = 1;
            msg.host_ptr = 0xaaaa0000;
            true
        });

        let mut msg = MessageMemRegion {
            fault_addr: 0x12000,
            start_page: 0,
            page_count: 0,
            host_ptr: 0,
        };
        assert!(bus.send(&mut msg));
        assert_eq!(msg.start_page, 0x12);
        assert_eq!(msg.host_ptr, 0xaaaa0000);
    }
}
