//! Client interfaces notified by the ACL manager
//!
//! Each interface is registered as a weak reference together with the
//! handler its methods must run on.

use crate::hci::acl_connection::AclConnection;
use crate::hci::address::{Address, AddressWithType, Role};
use crate::hci::error_code::ErrorCode;
use crate::hci::event::RemoteVersion;
use crate::hci::packet::{LinkPolicySettings, Mode, PacketTypes};
use crate::os::Handler;
use log::debug;
use std::rc::Weak;

pub trait ConnectionCallbacks {
    fn on_connect_success(&self, connection: AclConnection);
    fn on_connect_fail(&self, address: Address, reason: ErrorCode);
}

pub trait LeConnectionCallbacks {
    fn on_le_connect_success(&self, address_with_type: AddressWithType, connection: AclConnection);
    fn on_le_connect_fail(&self, address_with_type: AddressWithType, reason: ErrorCode);
}

/// Per-connection events. Every method defaults to doing nothing.
pub trait ConnectionManagementCallbacks {
    fn on_connection_packet_type_changed(&self, _packet_type: PacketTypes) {}
    fn on_authentication_complete(&self) {}
    fn on_authentication_failed(&self, _reason: ErrorCode) {}
    fn on_encryption_change(&self, _enabled: bool) {}
    fn on_flush_occurred(&self) {}
    fn on_read_rssi_complete(&self, _rssi: i8) {}
    fn on_mode_change(&self, _current_mode: Mode, _interval: u16) {}
    fn on_role_discovery_complete(&self, _current_role: Role) {}
    fn on_read_link_policy_settings_complete(&self, _settings: LinkPolicySettings) {}
    fn on_read_link_supervision_timeout_complete(&self, _timeout: u16) {}
    fn on_read_remote_version_information_complete(&self, _version: RemoteVersion) {}
    /// `features` is page 0 of the LMP feature mask
    fn on_read_remote_supported_features_complete(&self, _features: u64) {}
    fn on_read_clock_offset_complete(&self, _clock_offset: u16) {}
}

/// Events not tied to a single connection handle
pub trait AclManagerCallbacks {
    fn on_role_change(&self, address: Address, new_role: Role);
}

/// A registered callback target and the handler it runs on
pub(crate) struct CallbackRegistration<C: ?Sized> {
    callbacks: Weak<C>,
    handler: Handler,
}

impl<C: ?Sized + 'static> CallbackRegistration<C> {
    pub fn new(callbacks: Weak<C>, handler: &Handler) -> Self {
        Self {
            callbacks,
            handler: handler.clone(),
        }
    }

    /// Post `f` onto the target's handler. Dropped targets are skipped.
    pub fn post<F: FnOnce(&C) + 'static>(&self, f: F) {
        let callbacks = self.callbacks.clone();
        self.handler.post(move || match callbacks.upgrade() {
            Some(callbacks) => f(&callbacks),
            None => debug!("Callback target went away, dropping notification"),
        });
    }
}
