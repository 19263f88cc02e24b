//! Generic Mealy-style state machine.
//!
//! Transitions are keyed by `(status, event)` and carry the next status plus a handler.
//! [`StateMachine::fire`] moves to the next status *before* running the handler, so a
//! handler that reads [`StateMachine::status`] sees the post-transition value.
//!
//! The table is built once at startup (`&mut self`); firing only needs `&self`. Callers
//! must serialize `fire` for one machine (the assistant does this with a single
//! event-dispatch task).

use crate::error::{VoiceError, VoiceResult};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One edge of the machine, handed to the handler when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S, E> {
    pub from: S,
    pub to: S,
    pub event: E,
}

/// Side effect attached to a transition. Runs synchronously on the firing task;
/// long work must be handed to a worker.
pub type TransitionHandler<S, E, P> = Arc<dyn Fn(Transition<S, E>, P) + Send + Sync>;

struct Edge<S, E, P> {
    to: S,
    handler: TransitionHandler<S, E, P>,
}

/// `(status, event) -> (next status, handler)` table with a current status.
pub struct StateMachine<S, E, P> {
    table: HashMap<(S, E), Edge<S, E, P>>,
    current: Mutex<S>,
}

impl<S, E, P> StateMachine<S, E, P>
where
    S: Copy + Eq + Hash + Debug + Send + 'static,
    E: Copy + Eq + Hash + Debug + Send + 'static,
{
    /// Create an empty machine starting in `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            table: HashMap::new(),
            current: Mutex::new(initial),
        }
    }

    /// Add one transition. Registering the same `(from, event)` twice is a configuration
    /// bug and fails with [`VoiceError::DuplicateTransition`].
    pub fn register<F>(&mut self, from: S, event: E, to: S, handler: F) -> VoiceResult<()>
    where
        F: Fn(Transition<S, E>, P) + Send + Sync + 'static,
    {
        if self.table.contains_key(&(from, event)) {
            return Err(VoiceError::DuplicateTransition {
                status: format!("{:?}", from),
                event: format!("{:?}", event),
            });
        }
        self.insert(from, event, to, handler);
        Ok(())
    }

    /// Add or overwrite a transition (the explicit "replace" flag).
    pub fn register_or_replace<F>(&mut self, from: S, event: E, to: S, handler: F)
    where
        F: Fn(Transition<S, E>, P) + Send + Sync + 'static,
    {
        if self.table.contains_key(&(from, event)) {
            debug!("Replacing transition ({:?}, {:?})", from, event);
        }
        self.insert(from, event, to, handler);
    }

    fn insert<F>(&mut self, from: S, event: E, to: S, handler: F)
    where
        F: Fn(Transition<S, E>, P) + Send + Sync + 'static,
    {
        self.table.insert(
            (from, event),
            Edge {
                to,
                handler: Arc::new(handler),
            },
        );
    }

    /// Force the current status (startup or reset).
    pub fn init(&self, status: S) {
        *self.lock() = status;
    }

    /// Current status.
    pub fn status(&self) -> S {
        *self.lock()
    }

    /// Whether `(status, event)` has a registered transition.
    pub fn accepts(&self, status: S, event: E) -> bool {
        self.table.contains_key(&(status, event))
    }

    /// Feed an event. Unknown pairs are logged and ignored (status unchanged).
    pub fn fire(&self, event: E, payload: P) -> Option<Transition<S, E>> {
        let (transition, handler) = {
            let mut current = self.lock();
            let from = *current;
            let Some(edge) = self.table.get(&(from, event)) else {
                warn!("No transition for ({:?}, {:?}); status unchanged", from, event);
                return None;
            };
            *current = edge.to;
            (
                Transition {
                    from,
                    to: edge.to,
                    event,
                },
                Arc::clone(&edge.handler),
            )
        };

        debug!(
            "🔀 {:?} --{:?}--> {:?}",
            transition.from, transition.event, transition.to
        );
        handler(transition, payload);
        Some(transition)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, S> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Off,
        On,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Switch {
        Flip,
        Smash,
    }

    #[test]
    fn test_fire_moves_to_next_status() {
        let mut machine: StateMachine<Light, Switch, ()> = StateMachine::new(Light::Off);
        machine.register(Light::Off, Switch::Flip, Light::On, |_, _| {}).unwrap();
        machine.register(Light::On, Switch::Flip, Light::Off, |_, _| {}).unwrap();

        let t = machine.fire(Switch::Flip, ()).unwrap();
        assert_eq!(t.from, Light::Off);
        assert_eq!(t.to, Light::On);
        assert_eq!(machine.status(), Light::On);

        machine.fire(Switch::Flip, ());
        assert_eq!(machine.status(), Light::Off);
    }

    #[test]
    fn test_unregistered_pair_leaves_status_unchanged() {
        let mut machine: StateMachine<Light, Switch, ()> = StateMachine::new(Light::Off);
        machine.register(Light::Off, Switch::Flip, Light::On, |_, _| {}).unwrap();

        assert!(machine.fire(Switch::Smash, ()).is_none());
        assert_eq!(machine.status(), Light::Off);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut machine: StateMachine<Light, Switch, ()> = StateMachine::new(Light::Off);
        machine.register(Light::Off, Switch::Flip, Light::On, |_, _| {}).unwrap();

        let err = machine
            .register(Light::Off, Switch::Flip, Light::Off, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, VoiceError::DuplicateTransition { .. }));

        // Explicit replace is allowed and wins.
        machine.register_or_replace(Light::Off, Switch::Flip, Light::Off, |_, _| {});
        machine.fire(Switch::Flip, ());
        assert_eq!(machine.status(), Light::Off);
    }

    #[test]
    fn test_handler_sees_post_transition_status() {
        let slot: Arc<OnceLock<Arc<StateMachine<Light, Switch, u32>>>> = Arc::new(OnceLock::new());
        let seen = Arc::new(Mutex::new(None));

        let mut machine = StateMachine::new(Light::Off);
        let slot_in_handler = Arc::clone(&slot);
        let seen_in_handler = Arc::clone(&seen);
        machine
            .register(Light::Off, Switch::Flip, Light::On, move |t, payload| {
                let status = slot_in_handler.get().map(|m| m.status());
                *seen_in_handler.lock().unwrap() = Some((t, payload, status));
            })
            .unwrap();

        let machine = Arc::new(machine);
        assert!(slot.set(Arc::clone(&machine)).is_ok());
        machine.fire(Switch::Flip, 7);

        let (t, payload, status) = seen.lock().unwrap().take().unwrap();
        assert_eq!(t.event, Switch::Flip);
        assert_eq!(payload, 7);
        assert_eq!(status, Some(Light::On));
    }
}
