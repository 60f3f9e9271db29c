//! Typed publish-subscribe bus.
//!
//! Every device that wants to observe a message kind registers a closure with
//! [`Bus::add`]. Registration order is preserved and is the order in which
//! `send` tries receivers and `send_fifo` delivers to them.

/// A single subscriber: given a mutable reference to the message, returns
/// whether it claimed (fully handled) the message.
type Subscriber<M> = Box<dyn FnMut(&mut M) -> bool>;

/// An ordered list of subscribers for one message type.
pub struct Bus<M> {
    subscribers: Vec<Subscriber<M>>,
}

impl<M> Bus<M> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Register a new subscriber. Subscribers are tried in registration order.
    pub fn add<F>(&mut self, handler: F)
    where
        F: FnMut(&mut M) -> bool + 'static,
    {
        self.subscribers.push(Box::new(handler));
    }

    /// Deliver `msg` to subscribers in order, stopping at the first one that
    /// returns `true`. Returns `false` if no subscriber claimed it.
    pub fn send(&mut self, msg: &mut M) -> bool {
        for subscriber in &mut self.subscribers {
            if subscriber(msg) {
                return true;
            }
        }
        false
    }

    /// Deliver `msg` to every subscriber in order, ignoring return values.
    pub fn send_fifo(&mut self, msg: &mut M) {
        for subscriber in &mut self.subscribers {
            subscriber(msg);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<M> Default for Bus<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_stops_at_first_handler() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut bus: Bus<u32> = Bus::new();
        let calls = Rc::new(RefCell::new(Vec::new()));

        let log_a = Rc::clone(&calls);
        bus.add(move |_msg: &mut u32| {
            log_a.borrow_mut().push("a");
            false
        });
        let log_b = Rc::clone(&calls);
        bus.add(move |_msg: &mut u32| {
            log_b.borrow_mut().push("b");
            true
        });
        let log_c = Rc::clone(&calls);
        bus.add(move |_msg: &mut u32| {
            log_c.borrow_mut().push("c");
            true
        });

        let mut msg = 0u32;
        assert!(bus.send(&mut msg));
        assert_eq!(*calls.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn send_returns_false_when_unhandled() {
        let mut bus: Bus<u32> = Bus::new();
        bus.add(|_msg: &mut u32| false);
        let mut msg = 0u32;
        assert!(!bus.send(&mut msg));
    }

    #[test]
    fn send_fifo_reaches_every_subscriber_in_order() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut bus: Bus<u32> = Bus::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for id in 0..3u32 {
            let order = Rc::clone(&order);
            bus.add(move |_msg: &mut u32| {
                order.borrow_mut().push(id);
                true
            });
        }

        let mut msg = 0u32;
        bus.send_fifo(&mut msg);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }
}
