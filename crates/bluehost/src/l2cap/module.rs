//! Entry point for L2CAP clients

use super::channel::{DynamicChannel, FixedChannel};
use super::link_manager::LinkManager;
use super::psm::Psm;
use super::service::{
    DynamicChannelService, DynamicServiceRecord, FixedChannelService, FixedServiceRecord, PendingDynamicConnection,
    PendingFixedConnection,
};
use super::types::{ConnectionResult, RegistrationResult, SecurityPolicy, Transport};
use crate::config::L2capConfig;
use crate::hci::{AclManager, AddressWithType};
use crate::os::Handler;

/// L2CAP over both transports of one controller.
///
/// All L2CAP state lives on the handler given to [`L2capModule::new`]. The
/// managers returned here are cheap handles that post onto it.
pub struct L2capModule {
    classic: LinkManager,
    le: LinkManager,
}

impl L2capModule {
    pub fn new(acl: &AclManager, handler: &Handler, classic_config: L2capConfig, le_config: L2capConfig) -> Self {
        Self {
            classic: LinkManager::new(Transport::Classic, acl, handler, classic_config),
            le: LinkManager::new(Transport::Le, acl, handler, le_config),
        }
    }

    pub fn classic_fixed_channel_manager(&self) -> FixedChannelManager {
        FixedChannelManager {
            manager: self.classic.clone(),
        }
    }

    pub fn classic_dynamic_channel_manager(&self) -> DynamicChannelManager {
        DynamicChannelManager {
            manager: self.classic.clone(),
        }
    }

    pub fn le_fixed_channel_manager(&self) -> FixedChannelManager {
        FixedChannelManager {
            manager: self.le.clone(),
        }
    }

    pub fn le_dynamic_channel_manager(&self) -> DynamicChannelManager {
        DynamicChannelManager {
            manager: self.le.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn link_count(&self, transport: Transport) -> usize {
        match transport {
            Transport::Classic => self.classic.link_count(),
            Transport::Le => self.le.link_count(),
        }
    }
}

/// Fixed channel services of one transport
#[derive(Clone)]
pub struct FixedChannelManager {
    manager: LinkManager,
}

impl FixedChannelManager {
    pub fn transport(&self) -> Transport {
        self.manager.transport()
    }

    /// Open a channel to `device` for every registered fixed service that
    /// lacks one, connecting the link first if needed.
    ///
    /// Success shows up as `on_open` calls on the services; `on_fail` only
    /// runs when no channel could be opened.
    pub fn connect_services<F>(&self, device: AddressWithType, handler: &Handler, on_fail: F)
    where
        F: FnOnce(ConnectionResult) + 'static,
    {
        let pending = PendingFixedConnection::new(handler, on_fail);
        self.manager
            .post(move |manager| manager.connect_fixed_channel_services(device, pending));
    }

    pub fn register_service<R, O>(&self, cid: u16, handler: &Handler, on_registered: R, on_open: O)
    where
        R: FnOnce(RegistrationResult, Option<FixedChannelService>) + 'static,
        O: Fn(FixedChannel) + 'static,
    {
        let record = FixedServiceRecord::new(handler, on_open);
        let handler = handler.clone();
        self.manager.post(move |manager| {
            let result = manager.register_fixed_service(cid, record);
            let service = (result == RegistrationResult::Success)
                .then(|| FixedChannelService::new(cid, manager.weak_self(), manager.handler().clone()));
            handler.post(move || on_registered(result, service));
        });
    }
}

/// Dynamic channel services of one transport
#[derive(Clone)]
pub struct DynamicChannelManager {
    manager: LinkManager,
}

impl DynamicChannelManager {
    pub fn transport(&self) -> Transport {
        self.manager.transport()
    }

    /// Open a channel to `psm` on `device`. Exactly one of `on_open` and
    /// `on_fail` runs.
    pub fn connect_channel<O, F>(
        &self,
        device: AddressWithType,
        psm: Psm,
        security_policy: SecurityPolicy,
        handler: &Handler,
        on_open: O,
        on_fail: F,
    ) where
        O: FnOnce(DynamicChannel) + 'static,
        F: FnOnce(ConnectionResult) + 'static,
    {
        let pending = PendingDynamicConnection::new(psm, security_policy, handler, on_open, on_fail);
        self.manager
            .post(move |manager| manager.connect_dynamic_channel(device, pending));
    }

    pub fn register_service<R, O>(
        &self,
        psm: Psm,
        security_policy: SecurityPolicy,
        handler: &Handler,
        on_registered: R,
        on_open: O,
    ) where
        R: FnOnce(RegistrationResult, Option<DynamicChannelService>) + 'static,
        O: Fn(DynamicChannel) + 'static,
    {
        let record = DynamicServiceRecord::new(security_policy, handler, on_open);
        let handler = handler.clone();
        self.manager.post(move |manager| {
            let result = manager.register_dynamic_service(psm, record);
            let service = (result == RegistrationResult::Success)
                .then(|| DynamicChannelService::new(psm, manager.weak_self(), manager.handler().clone()));
            handler.post(move || on_registered(result, service));
        });
    }
}
