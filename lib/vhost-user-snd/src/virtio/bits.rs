// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// virtio-sound, VirtIO 1.2 section 5.14

/// VirtIO device ID for a sound device.
pub const VIRTIO_DEV_SOUND: u8 = 25;

/// ctrl, event, tx, rx.
pub const SOUND_QUEUE_COUNT: usize = 4;

/// Depth of each sound virtqueue.
pub const SOUND_QUEUE_SIZE: u16 = 64;

/// Device config space: jacks, streams, chmaps counts (three u32s).
pub const SOUND_CFG_SIZE: usize = 12;

// Device status bits written by the guest driver
pub const STATUS_ACKNOWLEDGE: u8 = 1 << 0;
pub const STATUS_DRIVER: u8 = 1 << 1;
pub const STATUS_DRIVER_OK: u8 = 1 << 2;
pub const STATUS_FEATURES_OK: u8 = 1 << 3;
pub const STATUS_FAILED: u8 = 1 << 7;
