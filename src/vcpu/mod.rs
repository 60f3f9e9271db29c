//! Per-vCPU execution: the handler chain that consumes [`CpuMessage`]s and
//! the dispatcher that drives it from real KVM exits.

pub mod dispatch;

use crate::bus::Bus;
use crate::messages::CpuMessage;

/// The ordered chain of receivers for one vCPU's [`CpuMessage`]s.
///
/// Reuses [`Bus`] directly: the chain *is* a publish-subscribe bus over one
/// message type, just like every other bus in the fabric, with `send`
/// giving exactly the "first handler that claims it wins" semantics the
/// exit dispatcher needs.
pub type HandlerChain = Bus<CpuMessage>;

/// Advance past the instruction that caused the current exit and clear any
/// interrupt-shadow bits it set up (the `STI`/`MOV SS` one-instruction delay).
///
/// Only touches the message's own bookkeeping (`mtr_out`, `interrupt_state`);
/// see [`dispatch`] for why real guest registers don't need a matching write
/// for the exit kinds this crate handles.
pub fn skip_instruction(msg: &mut CpuMessage) {
    use crate::messages::{interrupt_state, mtd};

    msg.mtr_out |= mtd::RIP_LEN;
    let shadow_bits = interrupt_state::STI_BLOCKING | interrupt_state::MOV_SS_BLOCKING;
    if msg.interrupt_state & shadow_bits != 0 {
        msg.interrupt_state &= !shadow_bits;
        msg.mtr_out |= mtd::STATE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{interrupt_state, mtd, CpuMessageKind};

    #[test]
    fn skip_instruction_clears_interrupt_shadow() {
        let mut msg = CpuMessage::new(CpuMessageKind::Ioio);
        msg.interrupt_state = interrupt_state::STI_BLOCKING;
        skip_instruction(&mut msg);
        assert_eq!(msg.interrupt_state & 0b11, 0);
        assert_ne!(msg.mtr_out & mtd::RIP_LEN, 0);
        assert_ne!(msg.mtr_out & mtd::STATE, 0);
    }

    #[test]
    fn skip_instruction_is_a_no_op_on_state_when_no_shadow_set() {
        let mut msg = CpuMessage::new(CpuMessageKind::Hlt);
        skip_instruction(&mut msg);
        assert_eq!(msg.mtr_out & mtd::STATE, 0);
        assert_ne!(msg.mtr_out & mtd::RIP_LEN, 0);
    }
}
