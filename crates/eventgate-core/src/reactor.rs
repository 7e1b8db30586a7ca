//! Single-threaded cooperative reactor.
//!
//! Endpoints register a [`ReadHandler`] and receive a [`Registration`]
//! holding a [`Token`]. The owner drives the loop with [`Reactor::turn`],
//! an explicit *poll, then dispatch* cycle:
//!
//! ```text
//!   ┌──────────────┐  poll_ready (round-robin from cursor)   ┌──────────────┐
//!   │   Registry   │ ──────────────────────────────────────▶ │  ready set   │
//!   │ slot │ epoch │                                         │ (≤ max/turn) │
//!   └──────────────┘ ◀────────────────────────────────────── └──────────────┘
//!            ▲          on_readable, one handler at a time          │
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! - Handlers never run concurrently: the registry lives in an `Rc`, so the
//!   reactor cannot leave the thread that created it.
//! - A handler runs to completion before the next one is dispatched.
//! - Every dispatch re-checks the slot epoch, so no callback fires for a
//!   token once it has been deregistered, even within the same turn.
//! - The reactor drives tokio I/O resources; sockets handed to handlers
//!   must be registered with the tokio runtime that polls [`Reactor::turn`].

use std::cell::RefCell;
use std::fmt;
use std::future::{Future, poll_fn};
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use tracing::{debug, trace};

/// Identifies one registration. Stale once deregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    index: usize,
    epoch: u64,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.epoch)
    }
}

/// What the reactor should do with a handler after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep the registration.
    Continue,
    /// Drop the handler and free its slot.
    Remove,
}

/// A readable resource plus the callback that services it.
pub trait ReadHandler {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Register interest and report whether the resource is readable.
    ///
    /// Must not block. Readiness is cleared by the reads done in
    /// [`on_readable`](Self::on_readable).
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()>;

    /// Service the resource. Must not block and must bound its own work.
    fn on_readable(&mut self) -> Dispatch;
}

/// Errors from registration operations.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("registration {0} is no longer valid")]
    StaleToken(Token),

    #[error("the reactor has been dropped")]
    Gone,
}

struct Entry {
    /// `None` while the handler is out for dispatch.
    handler: Option<Box<dyn ReadHandler>>,
    armed: bool,
}

struct Slot {
    epoch: u64,
    entry: Option<Entry>,
}

struct Registry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    cursor: usize,
    max_dispatch_per_turn: usize,
    stopped: bool,
    waker: Option<Waker>,
    turns: u64,
    dispatches: u64,
}

impl Registry {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn entry_mut(&mut self, token: Token) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(token.index)?;
        if slot.epoch != token.epoch {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Free the slot and hand back the handler (if it is not out for dispatch).
    fn remove(&mut self, token: Token) -> Option<Option<Box<dyn ReadHandler>>> {
        let slot = self.slots.get_mut(token.index)?;
        if slot.epoch != token.epoch {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.epoch += 1;
        self.free.push(token.index);
        Some(entry.handler)
    }
}

/// Shared reference to a reactor. Cheap to clone; single-threaded.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<RefCell<Registry>>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.inner.borrow();
        f.debug_struct("Reactor")
            .field("registered", &(reg.slots.len() - reg.free.len()))
            .field("stopped", &reg.stopped)
            .field("turns", &reg.turns)
            .finish()
    }
}

impl Reactor {
    /// Create a reactor dispatching at most `max_dispatch_per_turn` handlers
    /// per turn.
    pub fn new(max_dispatch_per_turn: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Registry {
                slots: Vec::new(),
                free: Vec::new(),
                cursor: 0,
                max_dispatch_per_turn: max_dispatch_per_turn.max(1),
                stopped: false,
                waker: None,
                turns: 0,
                dispatches: 0,
            })),
        }
    }

    /// A handle that does not keep the reactor alive.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Register a handler. It is not polled until [`arm`](Self::arm)ed.
    pub fn register(&self, handler: Box<dyn ReadHandler>) -> Registration {
        let mut reg = self.inner.borrow_mut();
        let entry = Entry {
            handler: Some(handler),
            armed: false,
        };
        let index = match reg.free.pop() {
            Some(index) => {
                reg.slots[index].entry = Some(entry);
                index
            }
            None => {
                reg.slots.push(Slot {
                    epoch: 0,
                    entry: Some(entry),
                });
                reg.slots.len() - 1
            }
        };
        let token = Token {
            index,
            epoch: reg.slots[index].epoch,
        };
        trace!(%token, "Handler registered");
        Registration {
            token,
            reactor: self.clone(),
        }
    }

    /// Start polling a registered handler.
    pub fn arm(&self, token: Token) -> Result<(), ReactorError> {
        let mut reg = self.inner.borrow_mut();
        let entry = reg
            .entry_mut(token)
            .ok_or(ReactorError::StaleToken(token))?;
        entry.armed = true;
        reg.wake();
        Ok(())
    }

    /// Remove a registration, returning its handler.
    ///
    /// Returns `None` for a stale token, or when the handler is currently
    /// being dispatched (it is dropped once its callback returns).
    pub fn deregister(&self, token: Token) -> Option<Box<dyn ReadHandler>> {
        let removed = {
            let mut reg = self.inner.borrow_mut();
            let removed = reg.remove(token);
            if removed.is_some() {
                reg.wake();
            }
            removed
        };
        if removed.is_some() {
            trace!(%token, "Handler deregistered");
        }
        removed.flatten()
    }

    /// Whether `token` still names a live registration.
    pub fn is_registered(&self, token: Token) -> bool {
        self.inner.borrow_mut().entry_mut(token).is_some()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        let reg = self.inner.borrow();
        reg.slots.len() - reg.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completed turns and handler dispatches since creation.
    pub fn counters(&self) -> (u64, u64) {
        let reg = self.inner.borrow();
        (reg.turns, reg.dispatches)
    }

    /// Make pending and future turns return immediately.
    pub fn stop(&self) {
        let mut reg = self.inner.borrow_mut();
        reg.stopped = true;
        reg.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.borrow().stopped
    }

    /// Wait until at least one armed handler is readable, then dispatch the
    /// ready handlers in round-robin order. Returns the number dispatched
    /// (zero only when the reactor is stopped).
    pub async fn turn(&self) -> usize {
        let ready = poll_fn(|cx| self.poll_ready_set(cx)).await;
        self.dispatch(ready)
    }

    /// Run turns until `shutdown` completes or the reactor is stopped.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) {
        tokio::pin!(shutdown);
        while !self.is_stopped() {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = self.turn() => {}
            }
        }
        debug!("Reactor loop exited");
    }

    fn poll_ready_set(&self, cx: &mut Context<'_>) -> Poll<Vec<Token>> {
        let mut guard = self.inner.borrow_mut();
        let reg = &mut *guard;
        if reg.stopped {
            return Poll::Ready(Vec::new());
        }
        reg.waker = Some(cx.waker().clone());

        let count = reg.slots.len();
        if count == 0 {
            return Poll::Pending;
        }
        let start = reg.cursor % count;
        let mut ready = Vec::new();
        for offset in 0..count {
            let index = (start + offset) % count;
            let slot = &mut reg.slots[index];
            let epoch = slot.epoch;
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };
            if !entry.armed {
                continue;
            }
            let Some(handler) = entry.handler.as_mut() else {
                continue;
            };
            if handler.poll_ready(cx).is_ready() {
                ready.push(Token { index, epoch });
                if ready.len() == reg.max_dispatch_per_turn {
                    break;
                }
            }
        }

        if ready.is_empty() {
            return Poll::Pending;
        }
        reg.cursor = (start + 1) % count;
        Poll::Ready(ready)
    }

    fn dispatch(&self, ready: Vec<Token>) -> usize {
        let mut dispatched = 0;
        for token in ready {
            let taken = {
                let mut reg = self.inner.borrow_mut();
                match reg.entry_mut(token) {
                    Some(entry) if entry.armed => entry.handler.take(),
                    _ => None,
                }
            };
            let Some(mut handler) = taken else {
                continue;
            };

            let verdict = handler.on_readable();
            dispatched += 1;

            // Dropped outside the borrow: a handler's Drop may log or unlink.
            let _leftover = {
                let mut reg = self.inner.borrow_mut();
                match (verdict, reg.entry_mut(token)) {
                    (Dispatch::Continue, Some(entry)) => {
                        entry.handler = Some(handler);
                        None
                    }
                    (Dispatch::Remove, Some(_)) => {
                        reg.remove(token);
                        debug!(handler = handler.name(), %token, "Handler removed itself");
                        Some(handler)
                    }
                    (_, None) => Some(handler),
                }
            };
        }

        let mut reg = self.inner.borrow_mut();
        reg.turns += 1;
        reg.dispatches += dispatched as u64;
        dispatched
    }
}

/// Weak reference to a reactor, held by endpoints between registrations.
#[derive(Clone)]
pub struct ReactorHandle {
    inner: Weak<RefCell<Registry>>,
}

impl ReactorHandle {
    pub fn upgrade(&self) -> Result<Reactor, ReactorError> {
        self.inner
            .upgrade()
            .map(|inner| Reactor { inner })
            .ok_or(ReactorError::Gone)
    }
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// A live registration. Dropping it deregisters the handler.
pub struct Registration {
    token: Token,
    reactor: Reactor,
}

impl Registration {
    pub fn token(&self) -> Token {
        self.token
    }

    /// Start polling the handler.
    pub fn arm(&self) -> Result<(), ReactorError> {
        self.reactor.arm(self.token)
    }

    /// Whether the reactor still holds the handler (it may have removed
    /// itself after a fatal error).
    pub fn is_active(&self) -> bool {
        self.reactor.is_registered(self.token)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("token", &self.token)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        drop(self.reactor.deregister(self.token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    /// Always ready; records dispatch order in a shared log.
    struct Probe {
        name: &'static str,
        log: Rc<RefCell<Vec<&'static str>>>,
        ready: Rc<Cell<bool>>,
        verdict: Dispatch,
        dropped: Rc<Cell<bool>>,
    }

    impl Probe {
        fn new(name: &'static str, log: &Rc<RefCell<Vec<&'static str>>>) -> Self {
            Self {
                name,
                log: Rc::clone(log),
                ready: Rc::new(Cell::new(true)),
                verdict: Dispatch::Continue,
                dropped: Rc::new(Cell::new(false)),
            }
        }
    }

    impl ReadHandler for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<()> {
            if self.ready.get() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        }

        fn on_readable(&mut self) -> Dispatch {
            self.log.borrow_mut().push(self.name);
            self.verdict
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    async fn turn_within(reactor: &Reactor, ms: u64) -> Option<usize> {
        tokio::time::timeout(Duration::from_millis(ms), reactor.turn())
            .await
            .ok()
    }

    #[tokio::test]
    async fn test_unarmed_handlers_are_not_dispatched() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reactor = Reactor::new(8);
        let reg = reactor.register(Box::new(Probe::new("a", &log)));

        assert_eq!(turn_within(&reactor, 20).await, None);
        reg.arm().unwrap();
        assert_eq!(turn_within(&reactor, 20).await, Some(1));
        assert_eq!(*log.borrow(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_round_robin_start_rotates() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reactor = Reactor::new(1);
        let a = reactor.register(Box::new(Probe::new("a", &log)));
        let b = reactor.register(Box::new(Probe::new("b", &log)));
        a.arm().unwrap();
        b.arm().unwrap();

        for _ in 0..4 {
            assert_eq!(turn_within(&reactor, 20).await, Some(1));
        }
        assert_eq!(*log.borrow(), vec!["a", "b", "a", "b"]);
        assert_eq!(reactor.counters(), (4, 4));
    }

    #[tokio::test]
    async fn test_deregistered_token_never_dispatches() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reactor = Reactor::new(8);
        let probe = Probe::new("a", &log);
        let dropped = Rc::clone(&probe.dropped);
        let reg = reactor.register(Box::new(probe));
        reg.arm().unwrap();
        let token = reg.token();

        drop(reg);
        assert!(dropped.get());
        assert!(!reactor.is_registered(token));
        assert!(reactor.arm(token).is_err());
        assert_eq!(turn_within(&reactor, 20).await, None);
        assert!(log.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_slot_reuse_bumps_epoch() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reactor = Reactor::new(8);
        let first = reactor.register(Box::new(Probe::new("a", &log)));
        let old = first.token();
        drop(first);

        let second = reactor.register(Box::new(Probe::new("b", &log)));
        assert_ne!(second.token(), old);
        assert!(reactor.deregister(old).is_none());
        assert!(second.is_active());
        assert_eq!(reactor.len(), 1);
    }

    #[tokio::test]
    async fn test_handler_removing_itself() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reactor = Reactor::new(8);
        let mut probe = Probe::new("a", &log);
        probe.verdict = Dispatch::Remove;
        let dropped = Rc::clone(&probe.dropped);
        let reg = reactor.register(Box::new(probe));
        reg.arm().unwrap();

        assert_eq!(turn_within(&reactor, 20).await, Some(1));
        assert!(dropped.get());
        assert!(!reg.is_active());
        // Dropping the stale registration is harmless.
        drop(reg);
        assert!(reactor.is_empty());
    }

    #[tokio::test]
    async fn test_idle_handler_does_not_block_others() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reactor = Reactor::new(8);
        let idle = Probe::new("idle", &log);
        idle.ready.set(false);
        let a = reactor.register(Box::new(idle));
        let b = reactor.register(Box::new(Probe::new("busy", &log)));
        a.arm().unwrap();
        b.arm().unwrap();

        assert_eq!(turn_within(&reactor, 20).await, Some(1));
        assert_eq!(*log.borrow(), vec!["busy"]);
    }

    #[tokio::test]
    async fn test_stop_ends_run_until() {
        let reactor = Reactor::new(8);
        reactor.stop();
        assert_eq!(turn_within(&reactor, 20).await, Some(0));
        tokio::time::timeout(
            Duration::from_millis(100),
            reactor.run_until(std::future::pending()),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_until_shutdown_future() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let reactor = Reactor::new(8);
        let idle = Probe::new("idle", &log);
        idle.ready.set(false);
        let reg = reactor.register(Box::new(idle));
        reg.arm().unwrap();

        reactor
            .run_until(tokio::time::sleep(Duration::from_millis(10)))
            .await;
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_handle_does_not_keep_reactor_alive() {
        let reactor = Reactor::new(8);
        let handle = reactor.handle();
        assert!(handle.upgrade().is_ok());
        drop(reactor);
        assert!(matches!(handle.upgrade(), Err(ReactorError::Gone)));
    }
}
