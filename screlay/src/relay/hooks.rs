//! Named extension points.
//!
//! Handlers are registered per [`EventKind`] and called synchronously, in registration order, right
//! after the state change they report and before any PDU they announce is sent. Some events can
//! be vetoed by returning `Flow::Skip`:
//!
//! * `PduReceived`: the frame is dropped before it reaches the pairing engine or a queue.
//! * `PduSending`: the Security Manager command is not sent.
//! * `Forwarding`: the frame is not forwarded.
//!
//! For all other events the result is ignored.
//!
//! Handlers run while the relay holds internal locks, so they must not call back into the relay.
//!
//! [`EventKind`]: enum.EventKind.html

use super::Stage;
use crate::{
    l2cap::Frame,
    link::LinkId,
    security::{Command, Failure, Passkey, State},
};
use std::collections::HashMap;

/// Something observable happened in the relay.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event<'a> {
    StageChanged { from: Stage, to: Stage },
    PduReceived { link: LinkId, frame: &'a Frame },
    PduSending { link: LinkId, command: &'a Command },
    Forwarding { source: LinkId, frame: &'a Frame },
    PairingStateChanged { link: LinkId, state: State },
    PairingComplete { link: LinkId },
    PairingFailed(&'a Failure),
    NumericComparison { link: LinkId, value: u32 },
    PasskeyDisplay { link: LinkId, passkey: Passkey },
    PasskeyRecovered { passkey: Passkey },
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StageChanged { .. } => EventKind::StageChanged,
            Event::PduReceived { .. } => EventKind::PduReceived,
            Event::PduSending { .. } => EventKind::PduSending,
            Event::Forwarding { .. } => EventKind::Forwarding,
            Event::PairingStateChanged { .. } => EventKind::PairingStateChanged,
            Event::PairingComplete { .. } => EventKind::PairingComplete,
            Event::PairingFailed(_) => EventKind::PairingFailed,
            Event::NumericComparison { .. } => EventKind::NumericComparison,
            Event::PasskeyDisplay { .. } => EventKind::PasskeyDisplay,
            Event::PasskeyRecovered { .. } => EventKind::PasskeyRecovered,
        }
    }
}

/// The closed set of extension points.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    StageChanged,
    PduReceived,
    PduSending,
    Forwarding,
    PairingStateChanged,
    PairingComplete,
    PairingFailed,
    NumericComparison,
    PasskeyDisplay,
    PasskeyRecovered,
}

/// What a handler wants to happen next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Suppress the default behaviour (where the event supports it).
    Skip,
}

/// A registered handler.
pub type Handler = Box<dyn Fn(&Event<'_>) -> Flow + Send + Sync>;

/// Table of handlers, keyed by event kind.
#[derive(Default)]
pub struct Hooks {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of kind `kind`.
    pub fn on<F>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: Fn(&Event<'_>) -> Flow + Send + Sync + 'static,
    {
        self.handlers
            .entry(kind)
            .or_insert_with(Vec::new)
            .push(Box::new(handler));
        self
    }

    /// Removes all handlers of kind `kind`.
    pub fn clear(&mut self, kind: EventKind) {
        self.handlers.remove(&kind);
    }

    /// Calls every handler registered for the event's kind.
    ///
    /// All handlers run even if an earlier one returned `Skip`. Returns `Skip` if any did.
    pub fn dispatch(&self, event: &Event<'_>) -> Flow {
        let mut flow = Flow::Continue;
        if let Some(handlers) = self.handlers.get(&event.kind()) {
            for handler in handlers {
                if handler(event) == Flow::Skip {
                    flow = Flow::Skip;
                }
            }
        }
        flow
    }
}

impl core::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        kinds.sort_by_key(|(k, _)| *k as u8);
        f.debug_map().entries(kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn dispatch_by_kind() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new();
        let c = calls.clone();
        hooks.on(EventKind::PairingComplete, move |event| {
            assert_eq!(event.kind(), EventKind::PairingComplete);
            c.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        });

        let stage = Event::StageChanged {
            from: Stage::Scanning,
            to: Stage::Cloning,
        };
        assert_eq!(hooks.dispatch(&stage), Flow::Continue);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let done = Event::PairingComplete {
            link: LinkId::SlaveFacing,
        };
        hooks.dispatch(&done);
        hooks.dispatch(&done);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn skip_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks = Hooks::new();
        let (a, b) = (calls.clone(), calls.clone());
        hooks
            .on(EventKind::Forwarding, move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                Flow::Skip
            })
            .on(EventKind::Forwarding, move |_| {
                b.fetch_add(1, Ordering::SeqCst);
                Flow::Continue
            });

        let frame = Frame::new(crate::l2cap::Channel::ATT, vec![0x0A]);
        let event = Event::Forwarding {
            source: LinkId::MasterFacing,
            frame: &frame,
        };
        assert_eq!(hooks.dispatch(&event), Flow::Skip);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        hooks.clear(EventKind::Forwarding);
        assert_eq!(hooks.dispatch(&event), Flow::Continue);
    }
}
