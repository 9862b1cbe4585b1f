//! Stable inode identity for loopback nodes.
//!
//! The synthetic inode number mixes the backing file's device into the high
//! half of its inode number so that files sharing an inode number on
//! different devices (bind mounts, network filesystems) do not collide.
//!
//! Collision avoidance is probabilistic, not guaranteed. When both the device
//! id and the inode number fit in 32 bits, which covers traditional local
//! filesystems, the mapping is injective. A backing filesystem handing out
//! inode numbers that use the high 32 bits can be chosen so that
//! `swap(dev_a) ^ ino_a == swap(dev_b) ^ ino_b`; such pairs share an identity.

/// Identity the kernel tracks a node by for the lifetime of one mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StableAttr {
    pub mode: u32,
    /// Backing files are not reused for different content within one mount.
    pub generation: u64,
    pub ino: u64,
}

/// Exchange the high and low 32-bit halves.
#[inline]
pub fn swap_halves(value: u64) -> u64 {
    value.rotate_left(32)
}

/// Derive the synthetic inode for `(dev, ino)` relative to the backing
/// root's device.
#[inline]
pub fn synthetic_ino(dev: u64, ino: u64, root_dev: u64) -> u64 {
    (swap_halves(dev) ^ swap_halves(root_dev)) ^ ino
}

pub fn stable_attr(mode: u32, dev: u64, ino: u64, root_dev: u64) -> StableAttr {
    StableAttr {
        mode,
        generation: 1,
        ino: synthetic_ino(dev, ino, root_dev),
    }
}
