//! Event-driven state machine engine.
//!
//! A [`StateMachine`] serializes events against a [`TransitionTable`]:
//! exactly one handler runs per machine at a time, and events raised while a
//! handler is running (from another thread, or re-entrantly from the handler
//! itself) are queued and drained in FIFO order by whichever call is already
//! running.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One row of a transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, H> {
    /// Handler to run; `None` is an unconditional success.
    pub handler: Option<H>,
    /// State entered when the handler returns `true`.
    pub on_success: S,
    /// State entered when the handler returns `false`.
    pub on_failure: S,
}

impl<S, H> Transition<S, H> {
    /// Row with a handler.
    pub const fn new(handler: H, on_success: S, on_failure: S) -> Self {
        Self {
            handler: Some(handler),
            on_success,
            on_failure,
        }
    }

    /// Row without a handler.
    pub const fn always(next: S) -> Self
    where
        S: Copy,
    {
        Self {
            handler: None,
            on_success: next,
            on_failure: next,
        }
    }
}

/// Static `(state, event) -> transition` mapping plus handler dispatch.
pub trait TransitionTable {
    /// Machine state.
    type State: Copy + Eq + fmt::Debug;
    /// Event, including its payload.
    type Event: fmt::Debug;
    /// Handler identifier stored in table rows.
    type Handler: Copy + fmt::Debug;
    /// Whatever the handlers operate on.
    type Context: ?Sized;

    /// Row for `(state, event)`, or `None` if the event is not handled there.
    fn lookup(
        &self,
        state: Self::State,
        event: &Self::Event,
    ) -> Option<Transition<Self::State, Self::Handler>>;

    /// Run a handler; `true` selects `on_success`.
    fn invoke(&self, handler: Self::Handler, ctx: &Self::Context, event: Self::Event) -> bool;
}

struct MachineInner<S, E> {
    state: S,
    busy: bool,
    pending: VecDeque<E>,
}

/// A single state machine instance.
pub struct StateMachine<S, E> {
    id: u32,
    inner: Mutex<MachineInner<S, E>>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + fmt::Debug,
    E: fmt::Debug,
{
    /// Create a machine in `initial` state.
    pub fn new(id: u32, initial: S) -> Self {
        Self {
            id,
            inner: Mutex::new(MachineInner {
                state: initial,
                busy: false,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Machine id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> S {
        self.lock().state
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether a handler is running.
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner<S, E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed an event to the machine.
    ///
    /// Returns immediately if another call is draining; the event is then
    /// processed by that call. The machine lock is never held while a
    /// handler runs.
    pub fn schedule<T>(&self, table: &T, ctx: &T::Context, event: E)
    where
        T: TransitionTable<State = S, Event = E> + ?Sized,
    {
        let mut inner = self.lock();
        if inner.busy {
            tracing::trace!(machine = self.id, ?event, "machine busy, event queued");
            inner.pending.push_back(event);
            return;
        }

        let mut event = event;
        loop {
            let state = inner.state;
            match table.lookup(state, &event) {
                Some(transition) => {
                    inner.busy = true;
                    drop(inner);

                    let ok = match transition.handler {
                        Some(handler) => table.invoke(handler, ctx, event),
                        None => true,
                    };

                    inner = self.lock();
                    inner.busy = false;
                    let next = if ok {
                        transition.on_success
                    } else {
                        transition.on_failure
                    };
                    if next != state {
                        tracing::debug!(machine = self.id, "state transition: {:?} -> {:?}", state, next);
                    }
                    inner.state = next;
                }
                None => {
                    tracing::debug!(
                        machine = self.id,
                        "no transition for {:?} in {:?}, event dropped",
                        event,
                        state
                    );
                }
            }

            match inner.pending.pop_front() {
                Some(queued) => event = queued,
                None => return,
            }
        }
    }
}

impl<S: fmt::Debug + Copy, E> fmt::Debug for StateMachine<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("busy", &inner.busy)
            .field("pending", &inner.pending.len())
            .finish()
    }
}
