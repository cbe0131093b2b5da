//! Callback that may be registered before or after its event occurs

use super::handler::Handler;
use log::warn;
use std::fmt;

type Callback<A> = Box<dyn FnOnce(A)>;

enum State<A> {
    /// The event has not happened yet.
    Waiting(Option<(Handler, Callback<A>)>),
    /// The event happened. `delivered` records whether a callback got the value.
    Fired { value: A, delivered: bool },
}

/// A single-use notification.
///
/// Whichever of [`register`](Self::register) and [`fire`](Self::fire) comes
/// second posts the callback, so the callback runs exactly once no matter
/// the order.
pub struct DeferredCallback<A> {
    state: State<A>,
}

impl<A: Clone + 'static> DeferredCallback<A> {
    pub fn new() -> Self {
        Self {
            state: State::Waiting(None),
        }
    }

    /// Register the callback; posts immediately if the event already fired.
    ///
    /// Panics if a callback was already registered.
    pub fn register<F: FnOnce(A) + 'static>(&mut self, handler: &Handler, callback: F) {
        match &mut self.state {
            State::Waiting(slot) => {
                assert!(slot.is_none(), "callback registered twice");
                *slot = Some((handler.clone(), Box::new(callback)));
            }
            State::Fired { value, delivered } => {
                assert!(!*delivered, "callback registered twice");
                *delivered = true;
                let value = value.clone();
                handler.post(move || callback(value));
            }
        }
    }

    /// Record the event; posts the callback if one is registered.
    pub fn fire(&mut self, value: A) {
        let previous = std::mem::replace(
            &mut self.state,
            State::Fired {
                value: value.clone(),
                delivered: false,
            },
        );
        match previous {
            State::Waiting(Some((handler, callback))) => {
                self.state = State::Fired {
                    value: value.clone(),
                    delivered: true,
                };
                handler.post(move || callback(value));
            }
            State::Waiting(None) => {}
            State::Fired { value, delivered } => {
                warn!("Deferred event fired twice, keeping the first value");
                self.state = State::Fired { value, delivered };
            }
        }
    }

    pub fn has_fired(&self) -> bool {
        matches!(self.state, State::Fired { .. })
    }
}

impl<A: Clone + 'static> Default for DeferredCallback<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: fmt::Debug> fmt::Debug for DeferredCallback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Waiting(slot) => write!(f, "Waiting(registered: {})", slot.is_some()),
            State::Fired { value, delivered } => {
                write!(f, "Fired({:?}, delivered: {})", value, delivered)
            }
        }
    }
}
