// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binding of host and guest notifiers around the started state.
//!
//! Notifiers are bound if and only if the device is started.  Each bind
//! stage's failure arm exactly reverses the stages already completed, so a
//! failed bind never leaves host-only or guest-only notifiers active.
//! Unbind always runs to completion: it executes during teardown, when the
//! guest may already be gone, so sub-step failures are logged rather than
//! propagated.

use slog::error;

use crate::vhost::BackendConnection;
use crate::virtio::queue::VirtQueues;
use crate::virtio::Transport;
use crate::Error;

pub(crate) struct NotifierCoordinator {
    log: slog::Logger,
    bound: bool,
}

impl NotifierCoordinator {
    pub fn new(log: slog::Logger) -> Self {
        Self { log, bound: false }
    }

    pub fn bound(&self) -> bool {
        self.bound
    }

    /// Bind notifiers and start the backend, in order: host notifiers,
    /// guest notifiers, backend start, queue unmask.  On failure the device
    /// is left exactly as it was before the call.
    pub fn bind(
        &mut self,
        conn: &mut BackendConnection,
        transport: &dyn Transport,
        queues: &VirtQueues,
        features: u64,
    ) -> Result<(), Error> {
        assert!(!self.bound, "notifiers bound once per start");

        if !transport.guest_notifiers_supported() {
            return Err(Error::NotifiersUnsupported);
        }

        conn.enable_notifiers()?;

        if let Err(e) = transport.set_guest_notifiers(queues.len(), true) {
            conn.disable_notifiers();
            return Err(Error::GuestNotifier(e));
        }

        if let Err(e) = conn.start(features) {
            if let Err(e2) = transport.set_guest_notifiers(queues.len(), false)
            {
                error!(
                    self.log,
                    "failed to release guest notifiers while unwinding: {e2}"
                );
            }
            conn.disable_notifiers();
            return Err(e);
        }

        // Not expected to fail; the transport masks lazily if it must.
        for vq in queues.iter() {
            transport.queue_notifier_mask(vq.id, false);
        }

        self.bound = true;
        Ok(())
    }

    /// Strict reverse of [`NotifierCoordinator::bind`].  Always runs every
    /// step to completion.
    pub fn unbind(
        &mut self,
        conn: &mut BackendConnection,
        transport: &dyn Transport,
        queues: &VirtQueues,
    ) {
        assert!(self.bound, "notifiers unbound once per stop");

        conn.stop();

        if let Err(e) = transport.set_guest_notifiers(queues.len(), false) {
            error!(self.log, "failed to release guest notifiers: {e}");
        }

        conn.disable_notifiers();
        self.bound = false;
    }
}
