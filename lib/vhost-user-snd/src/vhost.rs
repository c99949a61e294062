// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection to the external vhost-user backend process.
//!
//! [`BackendConnection`] tracks what the backend has been told so far and in
//! which order it is legal to tell it more.  The wire protocol itself
//! (message framing, memory-region sharing, ring doorbells) lives behind
//! [`ControlChannel`] and is supplied by the transport integration.

use std::io;
use std::sync::Arc;

use slog::{debug, error, o};

use crate::chardev::Chardev;
use crate::virtio::Features;
use crate::Error;

/// Operations of the vhost-user wire-protocol driver.
///
/// Implementations are expected to perform synchronous, bounded request/
/// reply exchanges with the backend process; any timeout policy belongs to
/// the implementation, not to the callers here.
pub trait ControlChannel: Send + Sync + 'static {
    /// Perform the ownership handshake with the backend.
    fn connect(&self) -> io::Result<()>;

    /// Query the feature bits the backend is capable of.
    fn device_features(&self) -> io::Result<u64>;

    /// Push the negotiated feature set to the backend.
    fn set_features(&self, features: u64) -> io::Result<()>;

    /// Tell the backend how many virtqueues it will service.
    fn set_queue_count(&self, count: usize) -> io::Result<()>;

    /// Enable or disable the host-side notifiers for `count` queues.
    fn set_host_notifiers(&self, count: usize, enable: bool) -> io::Result<()>;

    /// Transition the backend into active queue processing.
    fn start(&self) -> io::Result<()>;

    /// Transition the backend out of active queue processing.
    fn stop(&self) -> io::Result<()>;

    /// Release channel resources.  Must tolerate being called on a channel
    /// that never completed its handshake.
    fn disconnect(&self);
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, strum::IntoStaticStr)]
pub enum ConnectionStatus {
    /// Channel resources exist but the handshake has not completed.
    Uninitialized,

    /// Handshake done, backend feature mask cached.  Queues may be bound.
    Initialized,

    /// Backend is actively processing queues.  Held only while the device
    /// itself is started.
    DevStarted,
}

/// State of the channel to the external backend process.
pub struct BackendConnection {
    log: slog::Logger,
    channel: Box<dyn ControlChannel>,
    status: ConnectionStatus,
    dev_features: u64,
    nvqs: usize,
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("status", &self.status)
            .field("dev_features", &self.dev_features)
            .field("nvqs", &self.nvqs)
            .finish_non_exhaustive()
    }
}

impl BackendConnection {
    /// Open the control channel over the configured chardev endpoint,
    /// perform the handshake, and cache the backend's feature mask.
    ///
    /// The feature mask is queried exactly once, here; later negotiation is
    /// a pure function of the cached value.
    pub fn init(
        log: &slog::Logger,
        chardev: &Arc<dyn Chardev>,
    ) -> Result<Self, Error> {
        let log = log.new(o!("vhost-user" => chardev.label()));
        let channel = chardev.open().map_err(Error::BackendInit)?;

        let mut conn = Self {
            log,
            channel,
            status: ConnectionStatus::Uninitialized,
            dev_features: 0,
            nvqs: 0,
        };
        if let Err(e) = conn.channel.connect() {
            conn.channel.disconnect();
            return Err(Error::BackendInit(e));
        }
        conn.dev_features = match conn.channel.device_features() {
            Ok(feat) => feat,
            Err(e) => {
                conn.channel.disconnect();
                return Err(Error::BackendFeatures(e));
            }
        };
        conn.status = ConnectionStatus::Initialized;
        debug!(conn.log, "backend connected";
            "features" => format!("{:#x}", conn.dev_features));
        Ok(conn)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Record (and push to the backend) the number of virtqueues this
    /// connection will service.
    pub fn bind_queues(&mut self, count: usize) -> Result<(), Error> {
        assert_eq!(
            self.status,
            ConnectionStatus::Initialized,
            "queues bound on an initialized connection"
        );
        self.channel.set_queue_count(count).map_err(Error::BackendInit)?;
        self.nvqs = count;
        Ok(())
    }

    /// Intersect the fixed transport feature set with what the backend is
    /// capable of and what the guest side offered.
    ///
    /// Pure: the backend mask was cached at [`BackendConnection::init`], so
    /// repeated calls with the same `offered` bits agree.
    pub fn negotiate_features(&self, offered: u64) -> u64 {
        Features::supported().bits() & self.dev_features & offered
    }

    /// Enable the host-side notifiers the backend uses to signal queue
    /// completion.
    pub fn enable_notifiers(&mut self) -> Result<(), Error> {
        self.channel
            .set_host_notifiers(self.nvqs, true)
            .map_err(Error::HostNotifier)
    }

    /// Disable host-side notifiers.  Teardown path: failures are logged.
    pub fn disable_notifiers(&mut self) {
        if let Err(e) = self.channel.set_host_notifiers(self.nvqs, false) {
            error!(self.log, "failed to disable host notifiers: {e}");
        }
    }

    /// Push the negotiated feature set and start backend queue processing.
    pub fn start(&mut self, features: u64) -> Result<(), Error> {
        assert_eq!(
            self.status,
            ConnectionStatus::Initialized,
            "backend started from the initialized state"
        );
        self.channel.set_features(features).map_err(Error::BackendStart)?;
        self.channel.start().map_err(Error::BackendStart)?;
        self.status = ConnectionStatus::DevStarted;
        Ok(())
    }

    /// Take the backend out of active queue processing.  Teardown path:
    /// failures are logged, the connection is considered stopped regardless.
    pub fn stop(&mut self) {
        if self.status != ConnectionStatus::DevStarted {
            return;
        }
        if let Err(e) = self.channel.stop() {
            error!(self.log, "failed to stop vhost-user backend: {e}");
        }
        self.status = ConnectionStatus::Initialized;
    }

    /// Release the channel.  Idempotent, and safe on a connection that was
    /// never fully started.
    pub fn cleanup(&mut self) {
        if self.status == ConnectionStatus::DevStarted {
            self.stop();
        }
        if self.status == ConnectionStatus::Initialized {
            self.channel.disconnect();
            self.status = ConnectionStatus::Uninitialized;
        }
    }
}

impl Drop for BackendConnection {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::virtio::testutil::{test_log, TestChannelState, TestChardev};

    fn connect(state: &Arc<TestChannelState>) -> Result<BackendConnection, Error> {
        let chardev: Arc<dyn Chardev> = TestChardev::new(state.clone());
        BackendConnection::init(&test_log(), &chardev)
    }

    #[test]
    fn init_caches_features_once() {
        let state = TestChannelState::with_features(
            Features::supported().bits() | (1 << 5),
        );
        let conn = connect(&state).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Initialized);
        assert_eq!(state.feature_queries(), 1);

        // Negotiation is served from the cached mask.
        let _ = conn.negotiate_features(u64::MAX);
        let _ = conn.negotiate_features(0);
        assert_eq!(state.feature_queries(), 1);
    }

    #[test]
    fn init_failure_releases_channel() {
        let state = TestChannelState::new();
        state.fail_connect();
        let err = connect(&state).unwrap_err();
        assert!(matches!(err, Error::BackendInit(_)));
        assert!(state.disconnected());
    }

    #[test]
    fn feature_query_failure_releases_channel() {
        let state = TestChannelState::new();
        state.fail_features();
        let err = connect(&state).unwrap_err();
        assert!(matches!(err, Error::BackendFeatures(_)));
        assert!(state.disconnected());
    }

    #[test]
    fn negotiate_is_supported_and_backend_and_offered() {
        let backend = Features::VERSION_1 | Features::RING_EVENT_IDX;
        let state = TestChannelState::with_features(backend.bits() | (1 << 7));
        let conn = connect(&state).unwrap();

        let offered =
            (Features::VERSION_1 | Features::RING_INDIRECT_DESC).bits();
        let agreed = conn.negotiate_features(offered);
        // VERSION_1: supported, backend-capable, offered.
        assert_eq!(agreed, Features::VERSION_1.bits());
        // Repeat call agrees.
        assert_eq!(agreed, conn.negotiate_features(offered));
    }

    #[test]
    fn start_pushes_features_then_starts() {
        let state = TestChannelState::with_features(u64::MAX);
        let mut conn = connect(&state).unwrap();
        conn.bind_queues(4).unwrap();
        conn.start(Features::VERSION_1.bits()).unwrap();
        assert_eq!(conn.status(), ConnectionStatus::DevStarted);
        assert_eq!(state.acked_features(), Some(Features::VERSION_1.bits()));
        assert!(state.started());
    }

    #[test]
    fn stop_is_best_effort() {
        let state = TestChannelState::with_features(u64::MAX);
        let mut conn = connect(&state).unwrap();
        conn.bind_queues(4).unwrap();
        conn.start(0).unwrap();

        state.fail_stop();
        conn.stop();
        // Even a failed stop leaves the connection out of DevStarted.
        assert_eq!(conn.status(), ConnectionStatus::Initialized);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let state = TestChannelState::with_features(u64::MAX);
        let mut conn = connect(&state).unwrap();
        conn.cleanup();
        conn.cleanup();
        assert_eq!(conn.status(), ConnectionStatus::Uninitialized);
        assert!(state.disconnected());
        assert_eq!(state.disconnect_calls(), 1);
    }
}
