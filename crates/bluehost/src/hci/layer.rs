//! Boundary to the HCI transport
//!
//! The transport driver turning bytes into events lives outside this crate.
//! The connection layer talks to it only through [`HciLayer`].

use crate::hci::error_code::ErrorCode;
use crate::hci::event::HciEvent;
use crate::hci::packet::HciCommand;
use crate::os::{BidiQueueEnd, Handler};
use std::rc::Rc;

/// Outcome of a command, from either a Command Status or a Command Complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub opcode: u16,
    pub status: ErrorCode,
    /// Return parameters after the status byte (Command Complete only)
    pub return_parameters: Vec<u8>,
}

impl CommandResult {
    pub fn status(opcode: u16, status: ErrorCode) -> Self {
        Self {
            opcode,
            status,
            return_parameters: Vec::new(),
        }
    }
}

pub type CommandCallback = Box<dyn FnOnce(CommandResult)>;
pub type EventCallback = Rc<dyn Fn(HciEvent)>;
pub type CompletedPacketsCallback = Rc<dyn Fn(u16, u16)>;

pub trait HciLayer {
    /// Queue a command. `on_result` is posted on `handler` once the
    /// controller acknowledges it.
    fn enqueue_command(&self, command: HciCommand, handler: &Handler, on_result: CommandCallback);

    fn register_event_handler(&self, event_code: u8, handler: &Handler, callback: EventCallback);

    fn register_le_event_handler(&self, subevent_code: u8, handler: &Handler, callback: EventCallback);

    fn unregister_event_handler(&self, event_code: u8);

    fn unregister_le_event_handler(&self, subevent_code: u8);

    /// Called with `(handle, count)` for every Number Of Completed Packets entry
    fn register_completed_packets_callback(&self, handler: &Handler, callback: CompletedPacketsCallback);

    /// Serialized ACL frames: enqueue to transmit, dequeue what was received
    fn acl_queue_end(&self) -> BidiQueueEnd<Vec<u8>>;
}
