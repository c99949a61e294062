// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VMM-side front end for a vhost-user virtio sound device.
//!
//! The guest is presented with a standard virtio sound device, while all
//! audio queue processing is delegated to an external backend process
//! reached over a vhost-user control channel.  This crate owns the device
//! lifecycle: it sequences the backend connection, the four device
//! virtqueues, and the guest/host notifier set through
//! realize → start ⇄ stop → unrealize, unwinding partial progress whenever
//! a stage fails.
//!
//! The pieces this crate deliberately does not implement are consumed
//! through trait seams:
//!
//! - [`chardev::Chardev`] supplies the character-stream endpoint carrying
//!   the control channel, and [`vhost::ControlChannel`] is the wire-protocol
//!   driver itself.
//! - [`virtio::Transport`] is the bus binding which routes guest interrupt
//!   notifiers.
//! - Virtqueue rings are never traversed here; the backend process drains
//!   them out-of-band.

pub extern crate usdt;

use std::io;

pub mod chardev;
mod notifiers;
pub mod vhost;
pub mod virtio;

pub use virtio::snd::{SoundOpts, VhostUserSound};
pub use virtio::VirtioDevice;

/// Errors surfaced by the device lifecycle.
///
/// Realize and start report the first failure encountered after rolling
/// back any partial progress; stop and unrealize log their sub-step
/// failures instead of returning them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No chardev endpoint was configured for the backend channel.
    #[error("missing chardev endpoint for vhost-user backend")]
    MissingChardev,

    #[error("vhost-user backend initialization failed")]
    BackendInit(#[source] io::Error),

    #[error("vhost-user backend feature query failed")]
    BackendFeatures(#[source] io::Error),

    #[error("vhost-user backend start failed")]
    BackendStart(#[source] io::Error),

    #[error("could not enable host notifiers")]
    HostNotifier(#[source] io::Error),

    #[error("could not bind guest notifiers")]
    GuestNotifier(#[source] io::Error),

    /// The bus binding cannot route guest notifiers at all.
    #[error("transport does not support guest notifiers")]
    NotifiersUnsupported,

    #[error("virtqueue allocation failed")]
    QueueAlloc(#[source] virtio::queue::VqSizeError),

    /// Operation requires a realized device.
    #[error("device has not been realized")]
    NotRealized,
}
