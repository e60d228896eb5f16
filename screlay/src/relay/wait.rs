//! Bounded waiting.
//!
//! Every blocking operation takes a timeout and a [`Cancel`] token and reports which of the three
//! happened first. Waits are `select!`s over `crossbeam_channel` receivers: the awaited channel,
//! the cancellation signal and a deadline timer.
//!
//! [`Cancel`]: struct.Cancel.html

use crossbeam_channel::{after, bounded, select, unbounded, Receiver, Sender};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

/// Outcome of a bounded wait.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitResult<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

impl<T> WaitResult<T> {
    pub fn is_ready(&self) -> bool {
        match self {
            WaitResult::Ready(_) => true,
            _ => false,
        }
    }

    /// Returns the value, if the wait succeeded.
    pub fn ready(self) -> Option<T> {
        match self {
            WaitResult::Ready(value) => Some(value),
            _ => None,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A shared cancellation token.
///
/// Clones refer to the same token. Cancelling drops the only sender of a channel every waiter
/// selects on, which wakes all of them at once.
#[derive(Debug, Clone)]
pub struct Cancel {
    flag: Arc<AtomicBool>,
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancel {
    pub fn new() -> Self {
        let (trigger, signal) = bounded(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            trigger: Arc::new(Mutex::new(Some(trigger))),
            signal,
        }
    }

    /// Cancels all waits using this token, now and in the future.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        lock(&self.trigger).take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once cancelled. Nothing is ever sent on it.
    fn signal(&self) -> &Receiver<()> {
        &self.signal
    }
}

/// Receives from `rx` until `ready` accepts a value, the timeout expires, or `cancel` fires.
///
/// A disconnected `rx` counts as cancellation, since nothing can arrive on it anymore.
pub(crate) fn wait_for<T, U>(
    rx: &Receiver<T>,
    timeout: Duration,
    cancel: &Cancel,
    mut ready: impl FnMut(T) -> Option<U>,
) -> WaitResult<U> {
    let deadline = after(timeout);
    loop {
        if cancel.is_cancelled() {
            return WaitResult::Cancelled;
        }
        select! {
            recv(rx) -> msg => match msg {
                Ok(value) => {
                    if let Some(out) = ready(value) {
                        return WaitResult::Ready(out);
                    }
                }
                Err(_) => return WaitResult::Cancelled,
            },
            recv(cancel.signal()) -> _ => return WaitResult::Cancelled,
            recv(deadline) -> _ => return WaitResult::TimedOut,
        }
    }
}

/// Creates a bounded event channel for one link.
///
/// Link drivers push into the `Sender` (`try_send` if they must not block); the relay reads the
/// `Inbox`.
pub fn inbox<T>(capacity: usize) -> (Sender<T>, Inbox<T>) {
    let (tx, rx) = bounded(capacity);
    (
        tx,
        Inbox {
            rx,
            deferred: VecDeque::new(),
        },
    )
}

/// Receiving end of a link's event channel.
///
/// Items skipped by [`recv_matching`] are kept in arrival order and returned by later receives
/// before anything newer.
///
/// [`recv_matching`]: #method.recv_matching
#[derive(Debug)]
pub struct Inbox<T> {
    rx: Receiver<T>,
    deferred: VecDeque<T>,
}

impl<T> Inbox<T> {
    /// Returns the number of items waiting, deferred ones included.
    pub fn len(&self) -> usize {
        self.deferred.len() + self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty() && self.rx.is_empty()
    }

    /// Takes the oldest item.
    pub fn recv(&mut self, timeout: Duration, cancel: &Cancel) -> WaitResult<T> {
        self.recv_matching(timeout, cancel, |_| true)
    }

    /// Takes the oldest item accepted by `matches`, deferring all others in order.
    pub fn recv_matching(
        &mut self,
        timeout: Duration,
        cancel: &Cancel,
        mut matches: impl FnMut(&T) -> bool,
    ) -> WaitResult<T> {
        let Inbox { rx, deferred } = self;
        if let Some(item) = deferred
            .iter()
            .position(|item| matches(item))
            .and_then(|pos| deferred.remove(pos))
        {
            return WaitResult::Ready(item);
        }

        wait_for(rx, timeout, cancel, |item| {
            if matches(&item) {
                Some(item)
            } else {
                deferred.push_back(item);
                None
            }
        })
    }
}

/// Broadcasts values to everyone currently subscribed.
pub(crate) struct Watchers<T> {
    senders: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Watchers<T> {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        lock(&self.senders).push(tx);
        rx
    }

    /// Sends `value` to all subscribers, forgetting those that went away.
    pub(crate) fn publish(&self, value: T) {
        lock(&self.senders).retain(|tx| tx.send(value.clone()).is_ok());
    }
}
