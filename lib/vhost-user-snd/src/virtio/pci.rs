// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI binding metadata for the sound device.
//!
//! The bus adapter itself belongs to the enclosing VMM's transport layer;
//! what belongs here is the declarative identity the device is registered
//! with, and an explicit registration entry point in place of
//! load-time side effects.

use std::sync::OnceLock;

use super::bits::VIRTIO_DEV_SOUND;

pub const VENDOR_QUMRANET: u16 = 0x1af4;

/// Modern (virtio 1.x) PCI device id: 0x1040 plus the virtio device id.
pub const PCI_DEV_SOUND: u16 = 0x1040 + VIRTIO_DEV_SOUND as u16;

pub const CLASS_MULTIMEDIA: u8 = 0x04;
pub const SUBCLASS_AUDIO: u8 = 0x01;

/// Config-change vector plus ctrl and event queue vectors.
pub const MSIX_VECTORS: u16 = 3;

/// Declarative PCI identity of the sound device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Binding {
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub revision: u8,
    pub msix_vectors: u16,
    /// Exposed virtio-1 only; no legacy or transitional interface.
    pub modern_only: bool,
    /// No snapshot format is defined for this device.
    pub unmigratable: bool,
}

impl Binding {
    pub const fn sound() -> Self {
        Self {
            vendor_id: VENDOR_QUMRANET,
            device_id: PCI_DEV_SOUND,
            class: CLASS_MULTIMEDIA,
            subclass: SUBCLASS_AUDIO,
            revision: 0,
            msix_vectors: MSIX_VECTORS,
            modern_only: true,
            unmigratable: true,
        }
    }
}

/// Hand back the device-type binding, constructing it exactly once.
///
/// Called by the integrating VMM during process startup; repeat calls are
/// harmless and return the same binding.
pub fn register_types() -> &'static Binding {
    static BINDING: OnceLock<Binding> = OnceLock::new();
    BINDING.get_or_init(Binding::sound)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registration_is_idempotent() {
        let first = register_types();
        let again = register_types();
        assert!(std::ptr::eq(first, again));
        assert_eq!(*first, Binding::sound());
    }

    #[test]
    fn sound_identity() {
        let b = Binding::sound();
        assert_eq!(b.device_id, 0x1059);
        assert_eq!((b.class, b.subclass), (0x04, 0x01));
        assert!(b.modern_only);
        assert!(b.unmigratable);
    }
}
