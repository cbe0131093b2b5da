//! One-shot value handoff between a task and a caller outside its handler

use std::cell::RefCell;
use std::rc::Rc;

/// Producing half. Consumed by [`set_value`](Self::set_value).
pub struct Promise<T> {
    slot: Rc<RefCell<Option<T>>>,
}

/// Consuming half. Ready once the promise is fulfilled and the producing
/// task has run.
pub struct FutureValue<T> {
    slot: Rc<RefCell<Option<T>>>,
}

pub fn promise<T>() -> (Promise<T>, FutureValue<T>) {
    let slot = Rc::new(RefCell::new(None));
    (Promise { slot: slot.clone() }, FutureValue { slot })
}

impl<T> Promise<T> {
    pub fn set_value(self, value: T) {
        *self.slot.borrow_mut() = Some(value);
    }
}

impl<T> FutureValue<T> {
    pub fn is_ready(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Take the value if it has been produced
    pub fn take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}
