// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The four sound virtqueues.
//!
//! These rings are guest-visible but their contents are drained by the
//! external backend process, never by this crate.  What is kept here is the
//! bookkeeping the lifecycle needs: which queues exist, at what depth, and
//! an output handler per queue for the generic cleanup paths that expect
//! one.

use std::num::NonZeroU16;
use std::sync::Arc;

use super::bits::SOUND_QUEUE_COUNT;

/// The named sound virtqueues, in creation order.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, strum::FromRepr, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[repr(u16)]
pub enum SndQueue {
    Ctrl = 0,
    Event = 1,
    Tx = 2,
    Rx = 3,
}

impl SndQueue {
    pub const ALL: [SndQueue; SOUND_QUEUE_COUNT] =
        [SndQueue::Ctrl, SndQueue::Event, SndQueue::Tx, SndQueue::Rx];

    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VqSize(NonZeroU16);
impl VqSize {
    pub const fn new(size: u16) -> VqSize {
        let Some(size) = NonZeroU16::new(size) else {
            panic!("nonzero queue size");
        };
        assert!(size.is_power_of_two());
        Self(size)
    }
    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl TryFrom<u16> for VqSize {
    type Error = VqSizeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let value = NonZeroU16::new(value).ok_or(VqSizeError::IsZero)?;
        if !value.is_power_of_two() {
            Err(VqSizeError::NotPow2)
        } else {
            Ok(Self(value))
        }
    }
}

#[derive(Copy, Clone, Debug, thiserror::Error)]
pub enum VqSizeError {
    #[error("virtqueue size must be power of 2")]
    NotPow2,
    #[error("virtqueue size must not be 0")]
    IsZero,
}

pub type NotifyFn = Box<dyn Fn(&VirtQueue) + Send + Sync + 'static>;

pub struct VirtQueue {
    pub id: u16,
    size: VqSize,
    handler: NotifyFn,
}

impl VirtQueue {
    fn new(kind: SndQueue, size: VqSize, handler: NotifyFn) -> Self {
        Self { id: kind as u16, size, handler }
    }

    pub fn size(&self) -> u16 {
        self.size.get()
    }

    pub fn kind(&self) -> SndQueue {
        SndQueue::from_repr(self.id).expect("queue id names a sound queue")
    }

    /// Invoke the queue's output handler.  Queue processing happens
    /// out-of-band in the backend, so for a realized sound device this is a
    /// no-op, but generic virtio cleanup paths may still call it.
    pub fn notify(&self) {
        (self.handler)(self)
    }
}

/// Registry of the device's virtqueues.
///
/// Queues exist only between realize and unrealize.  Creation happens one
/// queue at a time so that a failure later in realize can release exactly
/// the queues created so far, in reverse creation order; the backend is
/// told the queue count only after all four exist.
pub struct VirtQueues {
    queues: Vec<Arc<VirtQueue>>,
}

impl VirtQueues {
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    /// Create the four sound queues at `size`, installing `handler(kind)`
    /// as each queue's output handler.
    pub fn alloc(
        &mut self,
        size: VqSize,
        mut handler: impl FnMut(SndQueue) -> NotifyFn,
    ) {
        assert!(self.queues.is_empty(), "queues allocated once per realize");
        for kind in SndQueue::ALL {
            self.queues.push(Arc::new(VirtQueue::new(
                kind,
                size,
                handler(kind),
            )));
        }
    }

    /// Destroy queues in reverse creation order.  Safe on a partial set.
    pub fn release(&mut self) {
        while let Some(vq) = self.queues.pop() {
            drop(vq);
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn get(&self, kind: SndQueue) -> Option<&Arc<VirtQueue>> {
        self.queues.get(kind as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VirtQueue>> {
        self.queues.iter()
    }
}
