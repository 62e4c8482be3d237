//! Reusable idle/loading/success/error machine.
//!
//! Workflows that only need to fetch something and remember the outcome
//! instantiate this instead of declaring their own copy of the same table.

use super::{Context, Machine, TransitionTable};
use std::fmt::Debug;
use std::sync::{Arc, LazyLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadState {
    Idle,
    Loading,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadEvent {
    Load,
    Resolve,
    Reject,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadContext<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> Default for LoadContext<T> {
    fn default() -> Self {
        Self { data: None, error: None }
    }
}

#[derive(Debug)]
pub struct LoadPatch<T> {
    pub data: Option<T>,
    pub error: Option<Option<String>>,
}

impl<T> Default for LoadPatch<T> {
    fn default() -> Self {
        Self { data: None, error: None }
    }
}

impl<T: Clone + Debug + Send> Context for LoadContext<T> {
    type Patch = LoadPatch<T>;

    fn merge(&mut self, patch: LoadPatch<T>) {
        if let Some(data) = patch.data {
            self.data = Some(data);
        }
        if let Some(error) = patch.error {
            self.error = error;
        }
    }
}

pub type LoadingMachine<T> = Machine<LoadState, LoadEvent, LoadContext<T>>;

static LOADING_TABLE: LazyLock<Arc<TransitionTable<LoadState, LoadEvent>>> = LazyLock::new(|| {
    use LoadState::*;
    Arc::new(
        TransitionTable::new()
            .on_any(&[Idle, Success, Error], LoadEvent::Load, Loading)
            .on(Loading, LoadEvent::Resolve, Success)
            .on(Loading, LoadEvent::Reject, Error)
            .on_any(&[Loading, Success, Error], LoadEvent::Reset, Idle),
    )
});

/// A fresh loading machine sharing the common table.
pub fn loading_machine<T: Clone + Debug + Send>(name: &'static str) -> LoadingMachine<T> {
    Machine::new(name, LoadState::Idle, Arc::clone(&LOADING_TABLE))
}

impl<T: Clone + Debug + Send> Machine<LoadState, LoadEvent, LoadContext<T>> {
    /// Enter `Loading`. Returns false when a load is already in flight.
    pub fn begin(&mut self) -> bool {
        self.send(LoadEvent::Load).is_transition()
    }

    pub fn resolve(&mut self, data: T) -> bool {
        self.send_with(
            LoadEvent::Resolve,
            LoadPatch {
                data: Some(data),
                error: Some(None),
            },
        )
        .is_transition()
    }

    pub fn reject(&mut self, message: impl Into<String>) -> bool {
        self.send_with(
            LoadEvent::Reject,
            LoadPatch {
                data: None,
                error: Some(Some(message.into())),
            },
        )
        .is_transition()
    }

    pub fn data(&self) -> Option<&T> {
        self.context().data.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.context().error.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.is(LoadState::Loading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_resolve_cycle() {
        let mut m: LoadingMachine<u32> = loading_machine("numbers");
        assert!(m.begin());
        assert!(!m.begin(), "second load while loading is ignored");
        assert!(m.resolve(7));
        assert_eq!(m.state(), LoadState::Success);
        assert_eq!(m.data(), Some(&7));
    }

    #[test]
    fn test_reject_keeps_previous_data() {
        let mut m: LoadingMachine<&'static str> = loading_machine("words");
        m.begin();
        m.resolve("first");
        m.begin();
        m.reject("offline");
        assert_eq!(m.state(), LoadState::Error);
        assert_eq!(m.error(), Some("offline"));
        assert_eq!(m.data(), Some(&"first"));

        m.begin();
        m.resolve("second");
        assert_eq!(m.error(), None);
    }

    #[test]
    fn test_resolve_outside_loading_is_ignored() {
        let mut m: LoadingMachine<u8> = loading_machine("late");
        assert!(!m.resolve(1));
        assert_eq!(m.state(), LoadState::Idle);
        assert_eq!(m.data(), None);
    }
}
