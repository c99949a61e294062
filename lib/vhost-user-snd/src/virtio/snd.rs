// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The vhost-user sound device.
//!
//! `VhostUserSound` sequences its backend connection, virtqueues, and
//! notifier set through the device lifecycle.  Realize and start either
//! complete or unwind every completed sub-step before returning; stop and
//! unrealize always run to completion so that teardown cannot leak the
//! backend channel or the queues.

use std::sync::{Arc, Mutex};

use slog::{debug, o};

use crate::chardev::Chardev;
use crate::notifiers::NotifierCoordinator;
use crate::vhost::BackendConnection;
use crate::virtio::bits;
use crate::virtio::queue::{VirtQueue, VirtQueues, VqSize};
use crate::virtio::{Transport, VirtioDevice};
use crate::Error;

#[usdt::provider(provider = "vusnd")]
mod probes {
    fn snd_realize() {}
    fn snd_unrealize() {}
    fn snd_start(features: u64) {}
    fn snd_stop() {}
    fn snd_set_status(status: u8) {}
}

/// Construction-time configuration.
pub struct SoundOpts {
    /// Endpoint carrying the vhost-user control channel.  Leaving this
    /// unset makes realize fail with [`Error::MissingChardev`].
    pub chardev: Option<Arc<dyn Chardev>>,

    /// Contents of the device config space.  The blob is opaque here; its
    /// layout is defined by the virtio sound specification and it is handed
    /// to the guest unmodified.  Its size is fixed for the device lifetime.
    pub config: Vec<u8>,

    /// Virtqueue depth override, power of two.
    pub queue_size: Option<u16>,
}

impl Default for SoundOpts {
    fn default() -> Self {
        Self {
            chardev: None,
            config: vec![0; bits::SOUND_CFG_SIZE],
            queue_size: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum DeviceState {
    /// Built, but not yet visible to the guest.
    Constructed,

    /// Realized, backend idle.
    Stopped,

    /// Realized, backend actively processing queues.
    Started,

    /// Torn down.  Terminal.
    Unrealized,
}

impl DeviceState {
    fn is_realized(self) -> bool {
        matches!(self, DeviceState::Stopped | DeviceState::Started)
    }
}

/// Realize steps completed so far, so a failure can unwind exactly those,
/// in reverse order of acquisition.
#[derive(Copy, Clone, Debug)]
enum RealizeStep {
    Connection,
    Identity,
    Queues,
}

#[derive(Default)]
struct RealizeLedger(Vec<RealizeStep>);

impl RealizeLedger {
    fn push(&mut self, step: RealizeStep) {
        self.0.push(step);
    }
    fn drain_rev(self) -> impl Iterator<Item = RealizeStep> {
        self.0.into_iter().rev()
    }
}

/// The guest-visible identity allocated at realize.
struct Identity {
    config: Box<[u8]>,
}

struct Inner {
    state: DeviceState,
    conn: Option<BackendConnection>,
    queues: VirtQueues,
    identity: Option<Identity>,
    /// Negotiated feature set, fixed once the device first starts.
    features: u64,
    features_fixed: bool,
    notifiers: NotifierCoordinator,
}

pub struct VhostUserSound {
    log: slog::Logger,
    chardev: Option<Arc<dyn Chardev>>,
    transport: Arc<dyn Transport>,
    queue_size: VqSize,
    config_template: Box<[u8]>,
    inner: Mutex<Inner>,
}

impl VhostUserSound {
    pub fn new(
        transport: Arc<dyn Transport>,
        opts: SoundOpts,
        log: slog::Logger,
    ) -> Result<Arc<Self>, Error> {
        let queue_size = match opts.queue_size {
            Some(size) => VqSize::try_from(size).map_err(Error::QueueAlloc)?,
            None => VqSize::new(bits::SOUND_QUEUE_SIZE),
        };
        let log = log.new(o!("device" => "vhost-user-snd"));
        let notifiers = NotifierCoordinator::new(log.clone());
        Ok(Arc::new(Self {
            log,
            chardev: opts.chardev,
            transport,
            queue_size,
            config_template: opts.config.into_boxed_slice(),
            inner: Mutex::new(Inner {
                state: DeviceState::Constructed,
                conn: None,
                queues: VirtQueues::new(),
                identity: None,
                features: 0,
                features_fixed: false,
                notifiers,
            }),
        }))
    }

    /// Is the device in the started state?
    pub fn running(&self) -> bool {
        self.inner.lock().unwrap().state == DeviceState::Started
    }

    fn realize_steps(
        &self,
        inner: &mut Inner,
        chardev: &Arc<dyn Chardev>,
        done: &mut RealizeLedger,
    ) -> Result<(), Error> {
        inner.conn = Some(BackendConnection::init(&self.log, chardev)?);
        done.push(RealizeStep::Connection);

        inner.identity =
            Some(Identity { config: self.config_template.clone() });
        done.push(RealizeStep::Identity);

        // Queues are created before the backend learns the queue count, so
        // a binding failure releases queues the backend never observed.
        inner.queues.alloc(self.queue_size, |_| {
            Box::new(|_vq| {
                // Drained out-of-band by the backend process.
            })
        });
        done.push(RealizeStep::Queues);

        let conn = inner.conn.as_mut().expect("connection was initialized");
        conn.bind_queues(inner.queues.len())?;
        Ok(())
    }

    fn unwind_realize(&self, inner: &mut Inner, done: RealizeLedger) {
        for step in done.drain_rev() {
            match step {
                RealizeStep::Queues => inner.queues.release(),
                RealizeStep::Identity => inner.identity = None,
                RealizeStep::Connection => {
                    if let Some(mut conn) = inner.conn.take() {
                        conn.cleanup();
                    }
                }
            }
        }
    }

    fn start_locked(&self, inner: &mut Inner) -> Result<(), Error> {
        match inner.state {
            DeviceState::Started => return Ok(()),
            DeviceState::Stopped => {}
            DeviceState::Constructed | DeviceState::Unrealized => {
                return Err(Error::NotRealized)
            }
        }

        let features = inner.features;
        let Inner { conn, queues, notifiers, .. } = &mut *inner;
        let conn = conn.as_mut().expect("realized device has a connection");
        notifiers.bind(conn, self.transport.as_ref(), queues, features)?;

        inner.features_fixed = true;
        inner.state = DeviceState::Started;
        probes::snd_start!(|| (features));
        Ok(())
    }

    fn stop_locked(&self, inner: &mut Inner) {
        if inner.state != DeviceState::Started {
            return;
        }

        let Inner { conn, queues, notifiers, .. } = &mut *inner;
        let conn = conn.as_mut().expect("realized device has a connection");
        notifiers.unbind(conn, self.transport.as_ref(), queues);

        // Stop is not allowed to get stuck in Started: the transition is
        // unconditional even when unbind sub-steps logged errors.
        inner.state = DeviceState::Stopped;
        probes::snd_stop!(|| ());
    }
}

impl VirtioDevice for VhostUserSound {
    fn type_name(&self) -> &'static str {
        "vhost-user-snd"
    }

    fn realize(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            matches!(inner.state, DeviceState::Constructed),
            "realize on a constructed device"
        );

        let chardev =
            self.chardev.as_ref().ok_or(Error::MissingChardev)?.clone();

        let mut done = RealizeLedger::default();
        match self.realize_steps(&mut inner, &chardev, &mut done) {
            Ok(()) => {
                inner.state = DeviceState::Stopped;
                probes::snd_realize!(|| ());
                debug!(self.log, "realized");
                Ok(())
            }
            Err(e) => {
                self.unwind_realize(&mut inner, done);
                Err(e)
            }
        }
    }

    fn unrealize(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.state.is_realized(),
            "unrealize on a realized device"
        );

        // Forced stop, regardless of whether the guest ever stopped us.
        self.stop_locked(&mut inner);

        if let Some(mut conn) = inner.conn.take() {
            conn.cleanup();
        }
        inner.queues.release();
        inner.identity = None;
        inner.state = DeviceState::Unrealized;
        probes::snd_unrealize!(|| ());
        debug!(self.log, "unrealized");
    }

    fn get_features(&self, offered: u64) -> Result<u64, Error> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.state.is_realized() {
            return Err(Error::NotRealized);
        }
        if inner.features_fixed {
            // The set was pushed to the backend when the device started;
            // renegotiation would require a full stop/unrealize cycle.
            return Ok(inner.features);
        }
        let conn =
            inner.conn.as_ref().expect("realized device has a connection");
        let negotiated = conn.negotiate_features(offered);
        inner.features = negotiated;
        Ok(negotiated)
    }

    fn get_config(&self) -> Result<Vec<u8>, Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .identity
            .as_ref()
            .map(|ident| ident.config.to_vec())
            .ok_or(Error::NotRealized)
    }

    fn set_status(&self, status: u8) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        probes::snd_set_status!(|| (status));

        let should_run = status & bits::STATUS_DRIVER_OK != 0;
        let running = inner.state == DeviceState::Started;
        if should_run == running {
            return Ok(());
        }

        if should_run {
            self.start_locked(&mut inner)
        } else {
            self.stop_locked(&mut inner);
            Ok(())
        }
    }

    fn queue_notify(&self, vq: &VirtQueue) {
        vq.notify()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::virtio::bits::{
        SOUND_CFG_SIZE, SOUND_QUEUE_COUNT, STATUS_ACKNOWLEDGE, STATUS_DRIVER,
        STATUS_DRIVER_OK,
    };
    use crate::virtio::testutil::{
        test_log, TestChannelState, TestChardev, TestTransport,
    };
    use crate::virtio::Features;

    struct Rig {
        state: Arc<TestChannelState>,
        transport: Arc<TestTransport>,
        dev: Arc<VhostUserSound>,
    }

    fn rig_with(with_chardev: bool, backend_features: u64) -> Rig {
        let state = TestChannelState::with_features(backend_features);
        let transport = Arc::new(TestTransport::new());
        let chardev = if with_chardev {
            let cd: Arc<dyn Chardev> = TestChardev::new(state.clone());
            Some(cd)
        } else {
            None
        };
        let opts = SoundOpts { chardev, ..Default::default() };
        let dev =
            VhostUserSound::new(transport.clone(), opts, test_log()).unwrap();
        Rig { state, transport, dev }
    }

    fn rig() -> Rig {
        rig_with(true, u64::MAX)
    }

    fn state_of(dev: &VhostUserSound) -> DeviceState {
        dev.inner.lock().unwrap().state
    }

    fn queue_count(dev: &VhostUserSound) -> usize {
        dev.inner.lock().unwrap().queues.len()
    }

    #[test]
    fn missing_chardev_fails_realize() {
        let r = rig_with(false, u64::MAX);
        let err = r.dev.realize().unwrap_err();
        assert!(matches!(err, Error::MissingChardev));
        assert_eq!(state_of(&r.dev), DeviceState::Constructed);
        // The guest-visible identity never came to exist.
        assert!(matches!(
            r.dev.get_config().unwrap_err(),
            Error::NotRealized
        ));
    }

    #[test]
    fn realize_creates_queues_and_stops() {
        let r = rig();
        r.dev.realize().unwrap();
        assert_eq!(state_of(&r.dev), DeviceState::Stopped);
        assert_eq!(queue_count(&r.dev), SOUND_QUEUE_COUNT);
        assert_eq!(r.state.queue_count(), Some(SOUND_QUEUE_COUNT));
        assert_eq!(r.dev.get_config().unwrap().len(), SOUND_CFG_SIZE);
    }

    #[test]
    fn realize_unrealize_round_trip() {
        let r = rig();
        r.dev.realize().unwrap();
        r.dev.unrealize();
        assert_eq!(state_of(&r.dev), DeviceState::Unrealized);
        assert_eq!(queue_count(&r.dev), 0);
        assert!(r.state.disconnected());
    }

    #[test]
    fn backend_init_failure_leaves_constructed() {
        let r = rig();
        r.state.fail_connect();
        let err = r.dev.realize().unwrap_err();
        assert!(matches!(err, Error::BackendInit(_)));
        assert_eq!(state_of(&r.dev), DeviceState::Constructed);
        assert_eq!(queue_count(&r.dev), 0);
        assert!(r.dev.inner.lock().unwrap().conn.is_none());
    }

    #[test]
    fn queue_binding_failure_rolls_back_fully() {
        let r = rig();
        r.state.fail_queue_count();
        let err = r.dev.realize().unwrap_err();
        assert!(matches!(err, Error::BackendInit(_)));
        assert_eq!(state_of(&r.dev), DeviceState::Constructed);
        assert_eq!(queue_count(&r.dev), 0);
        assert!(r.dev.inner.lock().unwrap().identity.is_none());
        // The connection from the earlier step was cleaned up too.
        assert!(r.state.disconnected());
    }

    #[test]
    fn set_status_is_idempotent() {
        let r = rig();
        r.dev.realize().unwrap();

        // Status writes short of DRIVER_OK do not start the device.
        r.dev.set_status(STATUS_ACKNOWLEDGE | STATUS_DRIVER).unwrap();
        assert_eq!(r.state.start_calls(), 0);

        r.dev.set_status(STATUS_DRIVER_OK).unwrap();
        r.dev.set_status(STATUS_DRIVER_OK).unwrap();
        assert_eq!(r.state.start_calls(), 1);
        assert!(r.dev.running());

        r.dev.set_status(0).unwrap();
        r.dev.set_status(0).unwrap();
        assert_eq!(r.state.stop_calls(), 1);
        assert_eq!(state_of(&r.dev), DeviceState::Stopped);
    }

    #[test]
    fn start_stop_restores_notifier_state() {
        let r = rig();
        r.dev.realize().unwrap();
        r.dev.set_status(STATUS_DRIVER_OK).unwrap();
        assert!(r.state.host_notifiers());
        assert!(r.transport.guest_bound());

        r.dev.set_status(0).unwrap();
        assert!(!r.state.host_notifiers());
        assert!(!r.transport.guest_bound());
        assert_eq!(r.transport.bind_calls(), 1);
        assert_eq!(r.transport.unbind_calls(), 1);
    }

    #[test]
    fn feature_negotiation_is_deterministic() {
        let backend = Features::VERSION_1 | Features::RING_EVENT_IDX;
        let r = rig_with(true, backend.bits());
        r.dev.realize().unwrap();

        let offered = Features::supported().bits();
        let first = r.dev.get_features(offered).unwrap();
        let second = r.dev.get_features(offered).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, backend.bits());
        // The backend was queried once, at connection init.
        assert_eq!(r.state.feature_queries(), 1);
    }

    #[test]
    fn features_fixed_after_first_start() {
        let r = rig();
        r.dev.realize().unwrap();
        let negotiated =
            r.dev.get_features(Features::supported().bits()).unwrap();
        r.dev.set_status(STATUS_DRIVER_OK).unwrap();
        assert_eq!(r.state.acked_features(), Some(negotiated));

        // A different offer after start yields the recorded set.
        assert_eq!(r.dev.get_features(0).unwrap(), negotiated);
    }

    #[test]
    fn get_features_requires_realize() {
        let r = rig();
        let err = r.dev.get_features(0).unwrap_err();
        assert!(matches!(err, Error::NotRealized));
    }

    #[test]
    fn unsupported_guest_notifiers_fail_start() {
        let r = rig();
        r.dev.realize().unwrap();
        r.transport.set_supported(false);

        let err = r.dev.set_status(STATUS_DRIVER_OK).unwrap_err();
        assert!(matches!(err, Error::NotifiersUnsupported));
        assert_eq!(state_of(&r.dev), DeviceState::Stopped);
        assert!(!r.state.host_notifiers());
    }

    #[test]
    fn start_failure_leaves_device_as_before() {
        let r = rig();
        r.dev.realize().unwrap();
        r.state.fail_start();

        let err = r.dev.set_status(STATUS_DRIVER_OK).unwrap_err();
        assert!(matches!(err, Error::BackendStart(_)));
        assert_eq!(state_of(&r.dev), DeviceState::Stopped);
        assert!(!r.state.host_notifiers());
        assert!(!r.transport.guest_bound());
    }

    #[test]
    fn unrealize_stops_started_device() {
        let r = rig();
        r.dev.realize().unwrap();
        r.dev.set_status(STATUS_DRIVER_OK).unwrap();

        r.dev.unrealize();
        assert_eq!(state_of(&r.dev), DeviceState::Unrealized);
        assert!(!r.state.started());
        assert_eq!(r.state.stop_calls(), 1);
        assert!(r.state.disconnected());
        assert_eq!(queue_count(&r.dev), 0);
    }
}
