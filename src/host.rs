//! The boundary between the VMM core and privileged host services.
//!
//! Every capability a device or the dispatcher needs from outside its own
//! process — allocating an I/O region, attaching a host IRQ, reading the
//! kernel module list, forwarding a console byte — goes through one
//! [`HostOp`] call. Kinds the running binary does not implement are
//! programming errors (the caller asked for something nobody wired up), not
//! runtime conditions, so they panic rather than returning an error value.

use crate::messages::HostOp;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O capability allocation failed: {0}")]
    Allocation(String),
    #[error("requested kernel module {0} not found")]
    ModuleNotFound(u32),
}

/// Result of a successful [`HostOp`].
#[derive(Debug)]
pub enum HostOpResult {
    Ack,
    Mac([u8; 6]),
    PhysAddr(u64),
    Fd(i32),
}

/// The host-facing capability boundary.
///
/// Implementations back this with whatever the deployment actually has
/// available (a local KVM instance, in this binary's case). Any `HostOp`
/// variant the implementation does not support must panic via
/// [`unimplemented_host_op`] rather than returning an error — requesting an
/// operation nobody built is a programming error, not something callers are
/// expected to recover from.
pub trait Host {
    fn hostop(&mut self, op: HostOp) -> Result<HostOpResult, HostError>;
}

/// Panic with a diagnostic naming the unimplemented operation and its
/// arguments, for the class of "this should never be reached" failures.
pub fn unimplemented_host_op(op: &HostOp) -> ! {
    panic!("unimplemented HostOp: {op:?}");
}

/// Minimal [`Host`] implementation sufficient to boot a guest and exercise
/// the bus fabric: memory/module/mac queries are answered locally, IRQ/vcpu
/// lifecycle ops are acknowledged (the real work happens in
/// [`crate::irq`]/[`crate::motherboard`]), and anything else panics.
pub struct LocalHost {
    mac: [u8; 6],
    module_paths: Vec<String>,
}

impl LocalHost {
    pub fn new(module_paths: Vec<String>) -> Self {
        Self {
            mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56],
            module_paths,
        }
    }
}

impl Host for LocalHost {
    fn hostop(&mut self, op: HostOp) -> Result<HostOpResult, HostError> {
        match op {
            HostOp::GetMac => Ok(HostOpResult::Mac(self.mac)),
            HostOp::GetModule { index } => {
                if (index as usize) < self.module_paths.len() {
                    Ok(HostOpResult::Ack)
                } else {
                    Err(HostError::ModuleNotFound(index))
                }
            }
            HostOp::AllocIoioRegion { .. }
            | HostOp::AllocIomem { .. }
            | HostOp::GuestMem { .. }
            | HostOp::AllocFromGuest { .. }
            | HostOp::NotifyIrq { .. }
            | HostOp::AttachIrq { .. }
            | HostOp::VcpuCreateBackend { .. }
            | HostOp::VcpuBlock { .. }
            | HostOp::VcpuRelease { .. }
            | HostOp::AllocWakeup
            | HostOp::AllocServiceThread
            | HostOp::VirtToPhys { .. }
            | HostOp::ReraiseIrq { .. } => Ok(HostOpResult::Ack),
        }
    }
}
