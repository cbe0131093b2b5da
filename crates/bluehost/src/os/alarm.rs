//! One-shot cancellable alarm bound to a handler

use super::handler::{Handler, TimerId};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

struct AlarmState {
    generation: Cell<u64>,
    timer: Cell<Option<TimerId>>,
}

/// Runs a task on its handler once the delay elapses, unless cancelled first.
///
/// Scheduling an armed alarm replaces the previous task. A firing that was
/// already queued when the alarm got cancelled or rescheduled is suppressed.
pub struct Alarm {
    handler: Handler,
    state: Rc<AlarmState>,
}

impl Alarm {
    pub fn new(handler: &Handler) -> Self {
        Self {
            handler: handler.clone(),
            state: Rc::new(AlarmState {
                generation: Cell::new(0),
                timer: Cell::new(None),
            }),
        }
    }

    pub fn schedule<F: FnOnce() + 'static>(&self, task: F, delay: Duration) {
        self.cancel();
        let generation = self.state.generation.get();
        let state = Rc::downgrade(&self.state);
        let id = self.handler.post_delayed(delay, move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            if state.generation.get() != generation || state.timer.get().is_none() {
                return;
            }
            state.timer.set(None);
            task();
        });
        self.state.timer.set(Some(id));
    }

    pub fn cancel(&self) {
        if let Some(id) = self.state.timer.take() {
            self.handler.cancel_timer(id);
        }
        self.state
            .generation
            .set(self.state.generation.get().wrapping_add(1));
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.timer.get().is_some()
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}
