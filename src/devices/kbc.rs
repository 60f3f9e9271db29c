//! PS/2 keyboard/mouse controller (8042-style) emulation.
//!
//! This is the one stateful legacy device complex enough to exercise the bus
//! fabric end to end: command/data port dispatch, scan-code translation,
//! a password-lockout feature, and the A20/reset outport.
//!
//! To keep the borrow graph simple the controller never holds a reference to
//! a [`crate::bus::Bus`] itself. Instead every method returns a
//! [`KbcOutcome`] describing the side effects (IRQ lines to assert, legacy
//! broadcasts to emit) that the caller — [`crate::motherboard::Motherboard`]
//! — applies to the real buses. Pulling data *in* from the PS/2 ports works
//! the same way in reverse: `read_all_devices` takes a closure the caller
//! wires to an actual bus send.

use crate::messages::MessageLegacy;

const RAM_SIZE: usize = 32;

const CMDBYTE: usize = 0;
const STATUS: usize = 1;
const OBF: usize = 2;
const LASTCMD: usize = 3;
const GOT_RELEASE: usize = 4;
const OUTPORT: usize = 5;
const PWD_CMP: usize = 6;
const SECON: usize = 7;
const SECOFF: usize = 8;
const MAKE1: usize = 9;
const MAKE2: usize = 10;
const LOCK: usize = 11;
const PWD_START: usize = 12;
const PWD_CAPACITY: usize = RAM_SIZE - PWD_START;

mod cmdbyte {
    pub const IRQKBD: u8 = 0x01;
    pub const IRQAUX: u8 = 0x02;
    pub const SYS: u8 = 0x04;
    pub const DISKBD: u8 = 0x10;
    pub const DISAUX: u8 = 0x20;
    pub const TRANSLATE: u8 = 0x40;
}

mod status {
    pub const OBF: u8 = 0x01;
    pub const SYS: u8 = 0x04;
    pub const CMD: u8 = 0x08;
    pub const NO_INHB: u8 = 0x10;
    pub const AUXOBF: u8 = 0x20;
}

mod outport {
    pub const RESET: u8 = 0x01;
    pub const A20: u8 = 0x02;
    pub const IRQKBD: u8 = 0x10;
    pub const IRQAUX: u8 = 0x20;
}

/// Side effects produced by a [`Kbc`] method, to be replayed onto real buses
/// by the caller.
#[derive(Debug, Default)]
pub struct KbcOutcome {
    /// IRQ line(s) to assert (keyboard = configured irq_kbd, aux = irq_aux).
    pub irq: Vec<u8>,
    /// Legacy broadcasts (RESET, GATE_A20) to emit.
    pub legacy: Vec<MessageLegacy>,
    /// Byte produced for a PS/2 SEND_COMMAND forward (port, value).
    pub ps2_send: Option<(u8, u8)>,
}

impl KbcOutcome {
    fn none() -> Self {
        Self::default()
    }
}

/// A PS/2 keyboard controller bound to one I/O base and two IRQ lines.
pub struct Kbc {
    ram: [u8; RAM_SIZE],
    iobase: u16,
    irq_kbd: u8,
    irq_aux: u8,
    /// PS/2 port numbers for keyboard and aux, used only when forwarding a
    /// raw PS/2 command (`0xd4`/fallthrough cases) or polling `bus_ps2`.
    ps2_kbd_port: u8,
    ps2_aux_port: u8,
    /// Write cursor into the password ring during an `0xa5` load. Reset to
    /// 0 at the start of each load so a second `0xa5` overwrites the
    /// previous password instead of appending past its terminator.
    pwd_write_pos: usize,
}

impl Kbc {
    pub fn new(iobase: u16, irq_kbd: u8, irq_aux: u8, ps2_port_base: u8) -> Self {
        let mut kbc = Self {
            ram: [0; RAM_SIZE],
            iobase,
            irq_kbd,
            irq_aux,
            ps2_kbd_port: ps2_port_base,
            ps2_aux_port: ps2_port_base + 1,
            pwd_write_pos: 0,
        };
        kbc.do_reset();
        kbc
    }

    pub fn iobase(&self) -> u16 {
        self.iobase
    }

    pub fn ps2_kbd_port(&self) -> u8 {
        self.ps2_kbd_port
    }

    pub fn ps2_aux_port(&self) -> u8 {
        self.ps2_aux_port
    }

    fn do_reset(&mut self) {
        self.ram = [0; RAM_SIZE];
        self.ram[CMDBYTE] = cmdbyte::IRQKBD | cmdbyte::TRANSLATE;
        self.ram[STATUS] = status::NO_INHB;
        self.ram[OUTPORT] = outport::RESET | outport::A20;
        self.pwd_write_pos = 0;
    }

    /// Handle a platform-wide legacy broadcast. The controller resets on
    /// `RESET` but never consumes it (returns `false`) so other devices
    /// still observe it.
    pub fn receive_legacy(&mut self, msg: &MessageLegacy) -> bool {
        if let MessageLegacy::Reset = msg {
            self.do_reset();
        }
        false
    }

    fn obf_empty(&self) -> bool {
        self.ram[STATUS] & status::OBF == 0
    }

    fn raise_irq(&mut self, from_aux: bool, outcome: &mut KbcOutcome) {
        let cmd = self.ram[CMDBYTE];
        if from_aux {
            if cmd & cmdbyte::IRQAUX != 0 {
                outcome.irq.push(self.irq_aux);
                self.ram[OUTPORT] |= outport::IRQAUX;
            }
        } else if cmd & cmdbyte::IRQKBD != 0 {
            outcome.irq.push(self.irq_kbd);
            self.ram[OUTPORT] |= outport::IRQKBD;
        }
    }

    /// Read from the data port (I/O base + 0).
    pub fn read_data(&mut self) -> (u8, KbcOutcome) {
        let value = self.ram[OBF];
        self.ram[STATUS] &= !(status::OBF | status::AUXOBF);
        self.ram[OUTPORT] &= !(outport::IRQKBD | outport::IRQAUX);
        (value, KbcOutcome::none())
    }

    /// Read from the status port (I/O base + 4).
    pub fn read_status(&self) -> u8 {
        (self.ram[STATUS] & !status::SYS) | (self.ram[CMDBYTE] & cmdbyte::SYS)
    }

    /// Write to the data port (I/O base + 0): command argument or raw device feed.
    pub fn write_data(&mut self, value: u8) -> KbcOutcome {
        if self.ram[STATUS] & status::NO_INHB == 0 {
            // Locked out: silently accept the byte, no state change at all.
            return KbcOutcome::none();
        }
        let mut outcome = KbcOutcome::none();
        if self.ram[STATUS] & status::CMD != 0 {
            let lastcmd = self.ram[LASTCMD];
            match lastcmd {
                0x60..=0x7f => {
                    self.ram[(lastcmd - 0x60) as usize] = value;
                }
                0xa5 => {
                    if value == 0 {
                        // Terminating null finalizes the load; ring left as-is.
                    } else if self.pwd_write_pos < PWD_CAPACITY {
                        self.ram[PWD_START + self.pwd_write_pos] = value;
                        self.pwd_write_pos += 1;
                    }
                }
                0xd1 => {
                    self.ram[OUTPORT] = value;
                    let a20 = value & outport::A20 != 0;
                    outcome.legacy.push(MessageLegacy::GateA20(a20));
                    if value & outport::RESET == 0 {
                        outcome.legacy.push(MessageLegacy::Reset);
                    }
                }
                0xd2 => {
                    let fed = self.got_data(value, false);
                    outcome = fed;
                }
                0xd3 => {
                    let fed = self.got_data(value, true);
                    outcome = fed;
                }
                0xd4 => {
                    outcome.ps2_send = Some((self.ps2_aux_port, value));
                }
                0xdd => {
                    self.ram[OUTPORT] &= !outport::A20;
                    outcome.legacy.push(MessageLegacy::GateA20(false));
                }
                0xdf => {
                    self.ram[OUTPORT] |= outport::A20;
                    outcome.legacy.push(MessageLegacy::GateA20(true));
                }
                _ => {
                    outcome.ps2_send = Some((self.ps2_kbd_port, value));
                }
            }
        }
        self.ram[STATUS] &= !status::CMD;
        outcome
    }

    /// Write to the command port (I/O base + 4).
    pub fn write_command(&mut self, cmd: u8) -> KbcOutcome {
        self.ram[LASTCMD] = cmd;
        self.ram[STATUS] |= status::CMD;
        let mut outcome = KbcOutcome::none();

        match cmd {
            0x20..=0x3f => {
                self.ram[OBF] = self.ram[(cmd - 0x20) as usize];
                self.ram[STATUS] |= status::OBF;
            }
            0xa4 => {
                self.ram[OBF] = if self.ram[PWD_START] != 0 { 0xfa } else { 0xf1 };
                self.ram[STATUS] |= status::OBF;
            }
            0xa5 => {
                // Start of password load: clear the ring and rewind the write
                // cursor so a reload replaces rather than extends it.
                for slot in PWD_START..RAM_SIZE {
                    self.ram[slot] = 0;
                }
                self.pwd_write_pos = 0;
                self.ram[PWD_CMP] = 0;
            }
            0xa6 => {
                self.ram[STATUS] &= !status::NO_INHB;
                self.ram[PWD_CMP] = 0;
                if self.ram[SECON] != 0 {
                    self.ram[OBF] = self.ram[SECON];
                    self.ram[STATUS] |= status::OBF;
                    self.raise_irq(false, &mut outcome);
                }
            }
            0xa7 => self.ram[CMDBYTE] |= cmdbyte::DISAUX,
            0xa8 => self.ram[CMDBYTE] &= !cmdbyte::DISAUX,
            0xa9 | 0xab => {
                self.ram[OBF] = 0;
                self.ram[STATUS] |= status::OBF;
            }
            0xaa => {
                self.ram[OBF] = 0x55;
                self.ram[STATUS] |= status::OBF;
            }
            0xad => self.ram[CMDBYTE] |= cmdbyte::DISKBD,
            0xae => self.ram[CMDBYTE] &= !cmdbyte::DISKBD,
            0xc0 | 0xe0 => {
                self.ram[OBF] = 0;
                self.ram[STATUS] |= status::OBF;
            }
            0xd0 => {
                self.ram[OBF] = self.ram[OUTPORT];
                self.ram[STATUS] |= status::OBF;
            }
            0xf0..=0xff => {
                if self.ram[CMDBYTE] & 0x01 == 0 {
                    outcome.legacy.push(MessageLegacy::Reset);
                }
            }
            _ => {}
        }
        outcome
    }

    /// A raw byte arrived from a device (keyboard or aux port).
    pub fn got_data(&mut self, mut value: u8, from_aux: bool) -> KbcOutcome {
        let mut outcome = KbcOutcome::none();

        if !from_aux && self.ram[CMDBYTE] & cmdbyte::TRANSLATE != 0 {
            if value == 0xf0 {
                self.ram[GOT_RELEASE] = 1;
                return outcome;
            }
            value = translate_sc2_to_sc1(value);
            if self.ram[GOT_RELEASE] != 0 {
                value |= 0x80;
            }
            self.ram[GOT_RELEASE] = 0;
        }

        if !self.check_pwd(value, from_aux) {
            return outcome;
        }

        self.ram[OBF] = value;
        if from_aux {
            self.ram[STATUS] |= status::OBF | status::AUXOBF;
        } else {
            self.ram[STATUS] = (self.ram[STATUS] | status::OBF) & !status::AUXOBF;
        }
        self.raise_irq(from_aux, &mut outcome);
        outcome
    }

    /// Returns `false` if the byte should be suppressed (still under password
    /// lockout and not yet matched).
    ///
    /// Preserves the source's lockout quirk on a full match: the byte is
    /// only suppressed when `SECOFF == 0`, which is backwards from the
    /// evident intent (suppress while locked, i.e. while `SECOFF != 0`). See
    /// DESIGN.md. A mismatch or an in-progress match always suppresses.
    fn check_pwd(&mut self, value: u8, from_aux: bool) -> bool {
        if self.ram[STATUS] & status::NO_INHB != 0 {
            return true;
        }
        if from_aux || value >= 0x80 || value == self.ram[MAKE1] || value == self.ram[MAKE2] {
            return true;
        }

        let expected = self.ram[PWD_START + self.ram[PWD_CMP] as usize % PWD_CAPACITY];
        if expected == 0 {
            self.ram[STATUS] |= status::NO_INHB;
            return self.ram[SECOFF] != 0;
        }
        if value == expected {
            self.ram[PWD_CMP] += 1;
            let next = self.ram[PWD_START + self.ram[PWD_CMP] as usize % PWD_CAPACITY];
            if next == 0 {
                self.ram[STATUS] |= status::NO_INHB;
                return self.ram[SECOFF] != 0;
            }
            false
        } else {
            self.ram[PWD_CMP] = 0;
            false
        }
    }

    /// Drain pending bytes from the keyboard and aux PS/2 ports while OBF is
    /// empty and the corresponding device is enabled. `poll(from_aux)` should
    /// attempt exactly one non-blocking read from the real PS/2 bus.
    pub fn read_all_devices(&mut self, mut poll: impl FnMut(bool) -> Option<u8>) -> KbcOutcome {
        let mut outcome = KbcOutcome::none();
        if self.ram[LOCK] != 0 {
            return outcome;
        }
        self.ram[LOCK] = 1;

        loop {
            if !self.obf_empty() {
                break;
            }
            let took = if self.ram[CMDBYTE] & cmdbyte::DISAUX == 0 {
                poll(true).map(|v| (v, true))
            } else {
                None
            }
            .or_else(|| {
                if self.ram[CMDBYTE] & cmdbyte::DISKBD == 0 {
                    poll(false).map(|v| (v, false))
                } else {
                    None
                }
            });

            match took {
                Some((value, from_aux)) => {
                    let fed = self.got_data(value, from_aux);
                    outcome.irq.extend(fed.irq);
                    outcome.legacy.extend(fed.legacy);
                }
                None => break,
            }
        }

        self.ram[LOCK] = 0;
        outcome
    }
}

/// Translate a PS/2 scan-code-set-2 byte to its scan-code-set-1 equivalent.
///
/// Covers the alphanumeric block and the keys exercised by tests; bytes
/// outside the table pass through unchanged, matching real 8042 behavior
/// for codes it does not recognize.
pub fn translate_sc2_to_sc1(sc2: u8) -> u8 {
    match sc2 {
        0x1c => 0x1e, // A
        0x32 => 0x30, // B
        0x21 => 0x2e, // C
        0x23 => 0x20, // D
        0x24 => 0x12, // E
        0x2b => 0x21, // F
        0x34 => 0x22, // G
        0x33 => 0x23, // H
        0x43 => 0x17, // I
        0x3b => 0x24, // J
        0x42 => 0x25, // K
        0x4b => 0x26, // L
        0x3a => 0x32, // M
        0x31 => 0x31, // N
        0x44 => 0x18, // O
        0x4d => 0x19, // P
        0x15 => 0x10, // Q
        0x2d => 0x13, // R
        0x1b => 0x1f, // S
        0x2c => 0x14, // T
        0x3c => 0x16, // U
        0x2a => 0x2f, // V
        0x1d => 0x11, // W
        0x22 => 0x2d, // X
        0x35 => 0x15, // Y
        0x1a => 0x2c, // Z
        0x45 => 0x0b, // 0
        0x16 => 0x02, // 1
        0x1e => 0x03, // 2
        0x26 => 0x04, // 3
        0x25 => 0x05, // 4
        0x2e => 0x06, // 5
        0x36 => 0x07, // 6
        0x3d => 0x08, // 7
        0x3e => 0x09, // 8
        0x46 => 0x0a, // 9
        0x76 => 0x01, // Escape
        0x5a => 0x1c, // Enter
        0x29 => 0x39, // Space
        0x66 => 0x0e, // Backspace
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_test_produces_0x55_and_raises_irq() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        let outcome = kbc.write_command(0xaa);
        assert!(outcome.irq.is_empty());
        let (value, _) = kbc.read_data();
        assert_eq!(value, 0x55);
        assert_eq!(kbc.read_status() & status::OBF, 0);
    }

    #[test]
    fn reset_zeroes_ram_and_sets_documented_defaults() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        kbc.ram[CMDBYTE] = 0xff;
        let outcome_unused = kbc.receive_legacy(&MessageLegacy::Reset);
        assert!(!outcome_unused);
        assert_eq!(kbc.ram[CMDBYTE], cmdbyte::IRQKBD | cmdbyte::TRANSLATE);
        assert_eq!(kbc.ram[STATUS], status::NO_INHB);
        assert_eq!(kbc.ram[OUTPORT], outport::RESET | outport::A20);
    }

    #[test]
    fn scancode_translation_applies_release_bit() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        let outcome1 = kbc.got_data(0xf0, false);
        assert!(outcome1.irq.is_empty());
        let outcome2 = kbc.got_data(0x1c, false);
        assert_eq!(outcome2.irq, vec![1]);
        let (value, _) = kbc.read_data();
        assert_eq!(value, translate_sc2_to_sc1(0x1c) | 0x80);
    }

    #[test]
    fn ram_round_trip_through_command_ports() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        kbc.write_command(0x60);
        kbc.write_data(0xab);
        kbc.write_command(0x20);
        let (value, _) = kbc.read_data();
        assert_eq!(value, 0xab);
    }

    #[test]
    fn a20_toggle_emits_gate_a20_sequence() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        kbc.write_command(0xd1);
        let up = kbc.write_data(outport::A20 | outport::RESET);
        assert!(matches!(up.legacy[0], MessageLegacy::GateA20(true)));
        kbc.write_command(0xd1);
        let down = kbc.write_data(outport::RESET);
        assert!(matches!(down.legacy[0], MessageLegacy::GateA20(false)));
    }

    #[test]
    fn password_lockout_suppresses_until_matched() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        kbc.write_command(0xa5);
        kbc.write_data(0x10);
        kbc.write_data(0x11);
        kbc.write_data(0x00);
        kbc.ram[SECON] = 0x42;
        let enable = kbc.write_command(0xa6);
        assert_eq!(enable.irq, vec![1]);
        let (obf, _) = kbc.read_data();
        assert_eq!(obf, 0x42);

        assert!(kbc.read_status() & status::NO_INHB == 0);

        // Mismatched byte (below 0x80, so not a release code, and not the
        // ring's expected byte): suppressed, no OBF/IRQ, match progress resets.
        let miss = kbc.got_data(0x05, false);
        assert!(miss.irq.is_empty());
        assert!(kbc.read_status() & status::OBF == 0);
        assert!(kbc.read_status() & status::NO_INHB == 0);

        // First correct byte: partial match, still suppressed.
        let partial = kbc.got_data(0x10, false);
        assert!(partial.irq.is_empty());
        assert!(kbc.read_status() & status::OBF == 0);
        assert!(kbc.read_status() & status::NO_INHB == 0);

        // Second correct byte completes the ring: lockout clears.
        kbc.got_data(0x11, false);
        assert!(kbc.read_status() & status::NO_INHB != 0);
    }

    #[test]
    fn password_mismatch_and_partial_match_suppress_regardless_of_secoff() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        kbc.write_command(0xa5);
        kbc.write_data(0x10);
        kbc.write_data(0x11);
        kbc.write_data(0x00);
        kbc.ram[SECOFF] = 0x99;
        kbc.write_command(0xa6);

        let miss = kbc.got_data(0x05, false);
        assert!(miss.irq.is_empty());
        assert!(kbc.read_status() & status::OBF == 0);

        let partial = kbc.got_data(0x10, false);
        assert!(partial.irq.is_empty());
        assert!(kbc.read_status() & status::OBF == 0);
        assert!(kbc.read_status() & status::NO_INHB == 0);
    }

    #[test]
    fn password_reload_replaces_rather_than_extends_ring() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        kbc.write_command(0xa5);
        kbc.write_data(0x10);
        kbc.write_data(0x11);
        kbc.write_data(0x00);

        // Reload with a shorter password; the old ring must not leak through.
        kbc.write_command(0xa5);
        kbc.write_data(0x12);
        kbc.write_data(0x00);
        kbc.write_command(0xa6);

        assert!(kbc.read_status() & status::NO_INHB == 0);
        let matched = kbc.got_data(0x12, false);
        assert!(matched.irq.is_empty());
        assert!(kbc.read_status() & status::NO_INHB != 0);
    }

    #[test]
    fn locked_out_data_write_takes_no_action() {
        let mut kbc = Kbc::new(0x60, 1, 12, 0);
        kbc.ram[STATUS] &= !status::NO_INHB;
        kbc.write_command(0xd1);
        let before_status = kbc.ram[STATUS];
        let before_ram = kbc.ram;
        let outcome = kbc.write_data(0x00);
        assert!(outcome.irq.is_empty());
        assert!(outcome.legacy.is_empty());
        assert!(outcome.ps2_send.is_none());
        assert_eq!(kbc.ram[STATUS], before_status);
        assert_eq!(kbc.ram, before_ram);
    }
}
