// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Character-stream endpoints carrying the vhost-user control channel.
//!
//! The enclosing VMM configures the device with one of these.  The endpoint
//! is only a conduit: the front end never reads or writes raw bytes itself,
//! it asks the endpoint to open the control channel and drives the backend
//! through that.

use std::io;
use std::sync::Arc;

use crate::vhost::ControlChannel;

/// A configured character-stream endpoint through which the external
/// backend process can be reached.
pub trait Chardev: Send + Sync + 'static {
    /// Label identifying the endpoint in log records.
    fn label(&self) -> String;

    /// Open the vhost-user control channel carried over this endpoint.
    ///
    /// Called once per realize; the returned channel is released via
    /// [`ControlChannel::disconnect`] when the device is torn down.
    fn open(&self) -> io::Result<Box<dyn ControlChannel>>;
}

pub type OpenFn =
    Box<dyn Fn() -> io::Result<Box<dyn ControlChannel>> + Send + Sync + 'static>;

/// [`Chardev`] built from a closure, for VMM integrations which establish
/// the underlying stream themselves (unix socket, fd passing, etc).
pub struct FnChardev {
    label: String,
    open: OpenFn,
}

impl FnChardev {
    pub fn new(label: impl ToString, open: OpenFn) -> Arc<Self> {
        Arc::new(Self { label: label.to_string(), open })
    }
}

impl Chardev for FnChardev {
    fn label(&self) -> String {
        self.label.clone()
    }
    fn open(&self) -> io::Result<Box<dyn ControlChannel>> {
        (self.open)()
    }
}
