//! Stable inode identity properties.

use std::collections::HashSet;

use compatfs::fs::ident::{stable_attr, synthetic_ino};
use proptest::prelude::*;

proptest! {
    #[test]
    fn distinct_devices_and_inodes_never_share_an_identity(
        pairs in proptest::collection::hash_set((any::<u32>(), any::<u32>()), 1..128),
        root_dev in any::<u32>(),
    ) {
        let mut seen = HashSet::new();
        for (dev, ino) in &pairs {
            let id = synthetic_ino(u64::from(*dev), u64::from(*ino), u64::from(root_dev));
            prop_assert!(seen.insert(id), "collision for dev={dev} ino={ino}");
        }
    }

    #[test]
    fn identity_is_a_pure_function(dev in any::<u64>(), ino in any::<u64>(), root_dev in any::<u64>()) {
        prop_assert_eq!(
            stable_attr(0o100644, dev, ino, root_dev),
            stable_attr(0o100644, dev, ino, root_dev)
        );
    }

    #[test]
    fn files_on_the_root_device_keep_their_inode(dev in any::<u64>(), ino in any::<u64>()) {
        prop_assert_eq!(synthetic_ino(dev, ino, dev), ino);
    }
}

#[test]
fn inodes_using_high_bits_can_collide() {
    // Known limitation: an inode number with bits above 32 can cancel the
    // device mixed into the high half.
    let root_dev = 0;
    assert_eq!(
        synthetic_ino(1, 0, root_dev),
        synthetic_ino(0, 1 << 32, root_dev)
    );
}

#[test]
fn generation_and_mode_are_carried() {
    let attr = stable_attr(0o040755, 7, 99, 7);
    assert_eq!(attr.mode, 0o040755);
    assert_eq!(attr.generation, 1);
    assert_eq!(attr.ino, 99);
}
