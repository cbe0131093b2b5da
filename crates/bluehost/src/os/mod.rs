//! Single-threaded execution substrate
//!
//! Components never share mutable state directly. Each one owns a [`Handler`]
//! and every cross-component call is a task posted onto the receiver's
//! handler. A [`Looper`] drives all handlers and owns the (virtual) clock
//! used by [`Alarm`].

pub mod alarm;
pub mod deferred;
pub mod handler;
pub mod promise;
pub mod queue;

pub use self::alarm::Alarm;
pub use self::deferred::DeferredCallback;
pub use self::handler::{Handler, Looper, Task, TimerId};
pub use self::promise::{promise, FutureValue, Promise};
pub use self::queue::{BidiQueue, BidiQueueEnd, DequeueCallback, Queue};
