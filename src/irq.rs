//! Host IRQ forwarding.
//!
//! Each attached host interrupt line gets one dedicated thread that blocks on
//! a wakeup, then asserts the corresponding guest IRQ line under the global
//! VM lock. A shared line additionally waits on a release wakeup so the host
//! IRQ isn't re-armed until every guest consumer has acknowledged it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::messages::MessageIrq;
use crate::motherboard::Motherboard;

/// A single-permit wakeup, functioning as a binary semaphore.
#[derive(Default)]
pub struct Wakeup {
    state: Mutex<bool>,
    cv: Condvar,
}

impl Wakeup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arm the wakeup and release one waiter.
    pub fn notify(&self) {
        let mut armed = self.state.lock().unwrap();
        *armed = true;
        self.cv.notify_one();
    }

    /// Block until armed, then consume the permit.
    pub fn wait(&self) {
        let mut armed = self.state.lock().unwrap();
        while !*armed {
            armed = self.cv.wait(armed).unwrap();
        }
        *armed = false;
    }
}

/// A worker forwarding one host IRQ line onto the guest's IRQ bus.
pub struct IrqForwarder {
    pub host_irq: u32,
    pub guest_line: u8,
    pub wakeup: Arc<Wakeup>,
    pub shared_release: Option<Arc<Wakeup>>,
}

impl IrqForwarder {
    /// Spawn the forwarder thread. Runs until the process exits.
    pub fn spawn(self, motherboard: Arc<Mutex<Motherboard>>) -> JoinHandle<()> {
        thread::spawn(move || loop {
            self.wakeup.wait();
            {
                let mut mb = motherboard.lock().unwrap();
                let mut msg = MessageIrq {
                    line: self.guest_line,
                };
                mb.hostirq.send_fifo(&mut msg);
            }
            if let Some(release) = &self.shared_release {
                release.wait();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn wakeup_delivers_exactly_one_permit_per_notify() {
        let wakeup = Wakeup::new();
        let worker = {
            let wakeup = Arc::clone(&wakeup);
            thread::spawn(move || {
                wakeup.wait();
                42
            })
        };
        thread::sleep(Duration::from_millis(10));
        wakeup.notify();
        assert_eq!(worker.join().unwrap(), 42);
    }
}
