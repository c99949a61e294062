// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fakes for exercising the device lifecycle without a real backend
//! process or bus binding: a recording control channel with failure
//! injection, a recording transport, and a chardev that hands them out.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::chardev::Chardev;
use crate::vhost::ControlChannel;
use crate::virtio::bits::SOUND_QUEUE_COUNT;
use crate::virtio::Transport;

pub(crate) fn test_log() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

fn inject() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "injected failure")
}

/// Shared state behind [`TestChannel`], kept by the test for inspection
/// while the connection owns the channel itself.
pub(crate) struct TestChannelState {
    features: u64,

    fail_connect: AtomicBool,
    fail_features: AtomicBool,
    fail_queue_count: AtomicBool,
    fail_host_notifiers: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,

    connected: AtomicBool,
    disconnected: AtomicBool,
    disconnect_calls: AtomicUsize,
    feature_queries: AtomicUsize,
    host_notifiers: AtomicBool,
    started: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    queue_count: Mutex<Option<usize>>,
    acked_features: Mutex<Option<u64>>,
}

impl TestChannelState {
    pub fn new() -> Arc<Self> {
        Self::with_features(u64::MAX)
    }

    pub fn with_features(features: u64) -> Arc<Self> {
        Arc::new(Self {
            features,
            fail_connect: AtomicBool::new(false),
            fail_features: AtomicBool::new(false),
            fail_queue_count: AtomicBool::new(false),
            fail_host_notifiers: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            disconnect_calls: AtomicUsize::new(0),
            feature_queries: AtomicUsize::new(0),
            host_notifiers: AtomicBool::new(false),
            started: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            queue_count: Mutex::new(None),
            acked_features: Mutex::new(None),
        })
    }

    pub fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }
    pub fn fail_features(&self) {
        self.fail_features.store(true, Ordering::SeqCst);
    }
    pub fn fail_queue_count(&self) {
        self.fail_queue_count.store(true, Ordering::SeqCst);
    }
    pub fn fail_host_notifiers(&self) {
        self.fail_host_notifiers.store(true, Ordering::SeqCst);
    }
    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }
    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }

    pub fn feature_queries(&self) -> usize {
        self.feature_queries.load(Ordering::SeqCst)
    }
    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
    pub fn host_notifiers(&self) -> bool {
        self.host_notifiers.load(Ordering::SeqCst)
    }
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
    pub fn queue_count(&self) -> Option<usize> {
        *self.queue_count.lock().unwrap()
    }
    pub fn acked_features(&self) -> Option<u64> {
        *self.acked_features.lock().unwrap()
    }
}

/// [`ControlChannel`] handed out by [`TestChardev`].
pub(crate) struct TestChannel(Arc<TestChannelState>);

impl ControlChannel for TestChannel {
    fn connect(&self) -> io::Result<()> {
        if self.0.fail_connect.load(Ordering::SeqCst) {
            return Err(inject());
        }
        self.0.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn device_features(&self) -> io::Result<u64> {
        self.0.feature_queries.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_features.load(Ordering::SeqCst) {
            return Err(inject());
        }
        Ok(self.0.features)
    }
    fn set_features(&self, features: u64) -> io::Result<()> {
        *self.0.acked_features.lock().unwrap() = Some(features);
        Ok(())
    }
    fn set_queue_count(&self, count: usize) -> io::Result<()> {
        if self.0.fail_queue_count.load(Ordering::SeqCst) {
            return Err(inject());
        }
        *self.0.queue_count.lock().unwrap() = Some(count);
        Ok(())
    }
    fn set_host_notifiers(&self, _count: usize, enable: bool) -> io::Result<()> {
        if enable && self.0.fail_host_notifiers.load(Ordering::SeqCst) {
            return Err(inject());
        }
        self.0.host_notifiers.store(enable, Ordering::SeqCst);
        Ok(())
    }
    fn start(&self) -> io::Result<()> {
        if self.0.fail_start.load(Ordering::SeqCst) {
            return Err(inject());
        }
        self.0.start_calls.fetch_add(1, Ordering::SeqCst);
        self.0.started.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn stop(&self) -> io::Result<()> {
        self.0.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_stop.load(Ordering::SeqCst) {
            return Err(inject());
        }
        self.0.started.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn disconnect(&self) {
        self.0.disconnected.store(true, Ordering::SeqCst);
        self.0.disconnect_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct TestChardev {
    state: Arc<TestChannelState>,
}

impl TestChardev {
    pub fn new(state: Arc<TestChannelState>) -> Arc<Self> {
        Arc::new(Self { state })
    }
}

impl Chardev for TestChardev {
    fn label(&self) -> String {
        "test-chardev".to_string()
    }
    fn open(&self) -> io::Result<Box<dyn ControlChannel>> {
        Ok(Box::new(TestChannel(self.state.clone())))
    }
}

/// Recording [`Transport`] with a capability toggle and bind-failure
/// injection.
pub(crate) struct TestTransport {
    supported: AtomicBool,
    fail_bind: AtomicBool,
    guest_bound: AtomicBool,
    bind_calls: AtomicUsize,
    unbind_calls: AtomicUsize,
    masked: Mutex<[bool; SOUND_QUEUE_COUNT]>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self {
            supported: AtomicBool::new(true),
            fail_bind: AtomicBool::new(false),
            guest_bound: AtomicBool::new(false),
            bind_calls: AtomicUsize::new(0),
            unbind_calls: AtomicUsize::new(0),
            masked: Mutex::new([false; SOUND_QUEUE_COUNT]),
        }
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }
    pub fn fail_bind(&self) {
        self.fail_bind.store(true, Ordering::SeqCst);
    }
    pub fn guest_bound(&self) -> bool {
        self.guest_bound.load(Ordering::SeqCst)
    }
    pub fn bind_calls(&self) -> usize {
        self.bind_calls.load(Ordering::SeqCst)
    }
    pub fn unbind_calls(&self) -> usize {
        self.unbind_calls.load(Ordering::SeqCst)
    }
    pub fn mask_all(&self) {
        *self.masked.lock().unwrap() = [true; SOUND_QUEUE_COUNT];
    }
    pub fn all_unmasked(&self) -> bool {
        self.masked.lock().unwrap().iter().all(|m| !m)
    }
}

impl Transport for TestTransport {
    fn guest_notifiers_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }
    fn set_guest_notifiers(
        &self,
        _count: usize,
        enable: bool,
    ) -> io::Result<()> {
        if enable {
            self.bind_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_bind.load(Ordering::SeqCst) {
                return Err(inject());
            }
        } else {
            self.unbind_calls.fetch_add(1, Ordering::SeqCst);
        }
        self.guest_bound.store(enable, Ordering::SeqCst);
        Ok(())
    }
    fn queue_notifier_mask(&self, queue: u16, masked: bool) {
        self.masked.lock().unwrap()[queue as usize] = masked;
    }
}
