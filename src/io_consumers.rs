//! Asynchronous host-side I/O consumers.
//!
//! Four long-lived threads bridge blocking host I/O (stdin, a completed disk
//! write, a timer tick, an inbound network packet) into the bus fabric. Each
//! one blocks on a channel receive, forwards under the global VM lock, then
//! goes back to waiting — Rust's ownership model retires the explicit
//! attach/get_buffer/forward/free_buffer life-cycle this pattern traditionally
//! needs, since the channel item is simply dropped once forwarded.

use std::io::Read;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::messages::{MessageDiskCommit, MessageInput, MessageTimer};
use crate::motherboard::Motherboard;

/// A chord recognized directly by the stdin consumer instead of being
/// forwarded as guest input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugChord {
    DumpCounters,
    ResetVm,
    RevokeMemory,
    Break,
}

fn classify(byte: u8) -> Option<DebugChord> {
    match byte {
        0x04 => Some(DebugChord::DumpCounters), // Ctrl-D
        0x12 => Some(DebugChord::ResetVm),       // Ctrl-R
        0x0f => Some(DebugChord::RevokeMemory),  // Ctrl-O
        0x02 => Some(DebugChord::Break),         // Ctrl-B
        _ => None,
    }
}

/// Spawn the stdin consumer. Recognized chords are handled locally; every
/// other byte is posted to `bus_input`.
pub fn spawn_stdin_consumer(motherboard: Arc<Mutex<Motherboard>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut byte = [0u8; 1];
        loop {
            match stdin.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if let Some(chord) = classify(byte[0]) {
                        let mut mb = motherboard.lock().unwrap();
                        mb.handle_debug_chord(chord);
                    } else {
                        let mut mb = motherboard.lock().unwrap();
                        let mut msg = MessageInput { value: byte[0] };
                        mb.input.send_fifo(&mut msg);
                    }
                }
                Err(e) => {
                    warn!("stdin consumer read error: {e}");
                    break;
                }
            }
        }
    })
}

/// Spawn the disk-commit consumer: forwards completed write IDs to
/// `bus_diskcommit`.
pub fn spawn_disk_commit_consumer(
    rx: Receiver<u64>,
    motherboard: Arc<Mutex<Motherboard>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for request_id in rx {
            let mut mb = motherboard.lock().unwrap();
            let mut msg = MessageDiskCommit { request_id };
            mb.diskcommit.send_fifo(&mut msg);
        }
    })
}

/// Spawn the timer-tick consumer: each tick drives one round of timeout-wheel
/// triggering and polls the KBC's PS/2 ports, mirroring how a real platform
/// drives both off the same periodic timer interrupt.
pub fn spawn_timer_consumer(
    rx: Receiver<()>,
    motherboard: Arc<Mutex<Motherboard>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for () in rx {
            let mut mb = motherboard.lock().unwrap();
            mb.poll_kbc();
            mb.drive_timeouts();
            let mut msg = MessageTimer;
            mb.timer.send_fifo(&mut msg);
        }
    })
}

/// Spawn the network-packet consumer. Sets `_forward_pkt` for the duration of
/// the forward so the network device can recognize (and skip re-queueing)
/// its own egress.
pub fn spawn_network_consumer(
    rx: Receiver<Vec<u8>>,
    motherboard: Arc<Mutex<Motherboard>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for packet in rx {
            let mut mb = motherboard.lock().unwrap();
            mb.forward_pkt = Some(packet.clone());
            mb.dispatch_network_packet(&packet);
            mb.forward_pkt = None;
        }
        info!("network consumer channel closed");
    })
}
