//! Table-driven finite state machine runtime.
//!
//! A [`Machine`] executes `(state, event) -> state` lookups against a
//! [`TransitionTable`] and shallow-merges a partial payload into its
//! [`Context`]. A pair that is absent from the table is a silent no-op: the
//! state and the context are left untouched, so a late async completion that
//! races a user action can never corrupt a workflow.
//!
//! The runtime knows nothing about side effects. Controllers inspect the
//! returned [`Outcome`] and run their own state-entry effects.

pub mod loading;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};

pub use loading::{loading_machine, LoadContext, LoadEvent, LoadPatch, LoadState, LoadingMachine};

/// Requirements on state and event tags.
pub trait Tag: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> Tag for T {}

/// Workflow data carried alongside the current state.
pub trait Context: Clone + Debug + Default + Send {
    /// Partial update. Fields left unset must leave the context untouched.
    type Patch: Debug + Default + Send;

    fn merge(&mut self, patch: Self::Patch);
}

impl Context for () {
    type Patch = ();

    fn merge(&mut self, _patch: ()) {}
}

/// Mapping `State -> (Event -> State)`.
#[derive(Debug, Clone)]
pub struct TransitionTable<S, E> {
    entries: HashMap<S, HashMap<E, S>>,
}

impl<S: Tag, E: Tag> Default for TransitionTable<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Tag, E: Tag> TransitionTable<S, E> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register `from --event--> to`. A later registration for the same pair wins.
    pub fn on(mut self, from: S, event: E, to: S) -> Self {
        self.entries.entry(from).or_default().insert(event, to);
        self
    }

    /// Register the same event from several source states.
    pub fn on_any(mut self, from: &[S], event: E, to: S) -> Self {
        for state in from {
            self = self.on(*state, event, to);
        }
        self
    }

    pub fn target(&self, from: S, event: E) -> Option<S> {
        self.entries.get(&from).and_then(|events| events.get(&event)).copied()
    }

    pub fn handles(&self, from: S, event: E) -> bool {
        self.target(from, event).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a single `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<S> {
    Transitioned { from: S, to: S },
    Ignored { state: S },
}

impl<S: Copy> Outcome<S> {
    /// The state that was entered, if the event matched the table.
    pub fn entered(&self) -> Option<S> {
        match self {
            Outcome::Transitioned { to, .. } => Some(*to),
            Outcome::Ignored { .. } => None,
        }
    }

    pub fn is_transition(&self) -> bool {
        matches!(self, Outcome::Transitioned { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord<S, E> {
    pub from: S,
    pub to: S,
    pub event: E,
    pub at: DateTime<Utc>,
}

const DEFAULT_MAX_HISTORY: usize = 64;

/// A running workflow instance: current state, context and transition table.
#[derive(Debug)]
pub struct Machine<S, E, C: Context> {
    name: &'static str,
    initial: S,
    state: S,
    context: C,
    table: Arc<TransitionTable<S, E>>,
    debug: bool,
    history: VecDeque<TransitionRecord<S, E>>,
    max_history: usize,
    clock: Arc<dyn Clock>,
}

impl<S: Tag, E: Tag, C: Context> Machine<S, E, C> {
    pub fn new(name: &'static str, initial: S, table: impl Into<Arc<TransitionTable<S, E>>>) -> Self {
        Self {
            name,
            initial,
            state: initial,
            context: C::default(),
            table: table.into(),
            debug: false,
            history: VecDeque::new(),
            max_history: DEFAULT_MAX_HISTORY,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_context(mut self, context: C) -> Self {
        self.context = context;
        self
    }

    /// Log every attempted transition, including no-ops.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Clock used to stamp transition history.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self.prune_history();
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn is(&self, state: S) -> bool {
        self.state == state
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn table(&self) -> &TransitionTable<S, E> {
        &self.table
    }

    /// Whether `event` would change anything in the current state.
    pub fn can(&self, event: E) -> bool {
        self.table.handles(self.state, event)
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord<S, E>> {
        self.history.iter()
    }

    /// Send an event without payload.
    pub fn send(&mut self, event: E) -> Outcome<S> {
        self.dispatch(event, None)
    }

    /// Send an event and merge `patch` into the context if the event applies.
    pub fn send_with(&mut self, event: E, patch: C::Patch) -> Outcome<S> {
        self.dispatch(event, Some(patch))
    }

    fn dispatch(&mut self, event: E, patch: Option<C::Patch>) -> Outcome<S> {
        let from = self.state;
        let target = self.table.target(from, event);

        if self.debug {
            debug!(
                machine = self.name,
                state = ?from,
                event = ?event,
                target = ?target,
                payload = ?patch,
                "Transition attempted"
            );
        }

        let Some(to) = target else {
            return Outcome::Ignored { state: from };
        };

        self.state = to;
        if let Some(patch) = patch {
            self.context.merge(patch);
        }
        self.record(from, to, event);

        Outcome::Transitioned { from, to }
    }

    /// Return to the initial state with a fresh context.
    pub fn reset(&mut self) {
        info!(machine = self.name, from = ?self.state, to = ?self.initial, "Machine reset");
        self.state = self.initial;
        self.context = C::default();
        self.history.clear();
    }

    fn record(&mut self, from: S, to: S, event: E) {
        self.history.push_back(TransitionRecord {
            from,
            to,
            event,
            at: self.clock.now(),
        });
        self.prune_history();
    }

    fn prune_history(&mut self) {
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}
