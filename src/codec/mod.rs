//! # Record Codecs
//!
//! Turn one entity into one opaque byte record and back.
//!
//! | Codec | Used by | Record contents |
//! |-------|---------|-----------------|
//! | [`BinaryCodec`] | changelog, kv store | persistent fields only, exact changelog layout |
//! | `JsonCodec` (feature `serde`) | document store | every field, children and aggregates included |
//!
//! A service encodes an entity exactly once per store and writes the result
//! as a single unit, so a record is never observed half-written.

mod binary;
mod buffer;
#[cfg(feature = "serde")]
mod json;

pub use binary::BinaryCodec;
pub use buffer::{Buffer, BufferReader};
#[cfg(feature = "serde")]
pub use json::JsonCodec;

use crate::md::{ContainerMd, FileMd};
use crate::NsError;

/// Entity ⇄ bytes conversion for one backing store.
pub trait Codec: Send + Sync {
    /// Encode a file record.
    fn encode_file(&self, file: &FileMd) -> Result<Vec<u8>, NsError>;

    /// Decode a file record.
    fn decode_file(&self, bytes: &[u8]) -> Result<FileMd, NsError>;

    /// Encode a container record.
    fn encode_container(&self, container: &ContainerMd) -> Result<Vec<u8>, NsError>;

    /// Decode a container record.
    fn decode_container(&self, bytes: &[u8]) -> Result<ContainerMd, NsError>;

    /// Returns `true` if container records carry child maps, `tree_size`
    /// and `tmtime`, so the store needs no side keys for them.
    fn self_contained(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timespec;
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;

    fn name() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9._-]{1,24}"
    }

    fn file_strategy() -> impl Strategy<Value = FileMd> {
        (
            (any::<u64>(), any::<u64>(), name(), proptest::option::of("/[a-z/]{1,20}")),
            (0u64..=crate::types::MAX_FILE_SIZE, any::<u16>(), any::<u32>(), any::<u32>(), any::<u32>()),
            (vec(any::<u8>(), 0..64), vec(1u32..1000, 0..6)),
            (any::<u32>(), any::<u32>(), any::<u32>(), any::<u32>()),
            btree_map("[a-z.]{1,12}", "[ -~]{0,16}", 0..4),
        )
            .prop_map(|(ids, meta, blobs, times, attributes)| {
                let (id, container_id, name, link) = ids;
                let (size, flags, cuid, cgid, layout) = meta;
                let (checksum, mut locations) = blobs;
                locations.dedup();
                let mut file = FileMd::new(id);
                file.set_container_id(container_id);
                file.set_name(name);
                file.set_link(link);
                file.set_size(size);
                file.set_flags(flags);
                file.set_cuid(cuid);
                file.set_cgid(cgid);
                file.set_layout_id(layout);
                file.set_checksum(checksum);
                file.set_ctime(Timespec::new(u64::from(times.0), u64::from(times.1)));
                file.set_mtime(Timespec::new(u64::from(times.2), u64::from(times.3)));
                for (i, location) in locations.iter().enumerate() {
                    file.add_location(*location);
                    if i % 2 == 1 {
                        file.unlink_location(*location);
                    }
                }
                for (k, v) in attributes {
                    file.set_attribute(k, v);
                }
                file.take_changes();
                file
            })
    }

    fn container_strategy() -> impl Strategy<Value = ContainerMd> {
        (
            (any::<u64>(), any::<u64>(), name(), any::<u16>()),
            (any::<u32>(), any::<u32>(), any::<u32>(), any::<u16>()),
            (any::<u32>(), any::<u32>(), any::<u32>(), any::<u32>()),
            btree_map("user\\.[a-z]{1,8}", "[ -~]{0,16}", 0..4),
        )
            .prop_map(|(ids, owner, times, attributes)| {
                let (id, parent_id, name, flags) = ids;
                let (cuid, cgid, mode, acl_id) = owner;
                let mut container = ContainerMd::new(id);
                container.set_parent_id(parent_id);
                container.set_name(name);
                container.set_flags(flags);
                container.set_cuid(cuid);
                container.set_cgid(cgid);
                container.set_mode(mode);
                container.set_acl_id(acl_id);
                container.set_ctime(Timespec::new(u64::from(times.0), u64::from(times.1)));
                let mtime = Timespec::new(u64::from(times.2), u64::from(times.3));
                container.set_mtime(mtime);
                container.set_tmtime(mtime);
                for (k, v) in attributes {
                    container.set_attribute(k, v).unwrap();
                }
                container
            })
    }

    proptest! {
        #[test]
        fn binary_file_records_are_stable(file in file_strategy()) {
            let bytes = BinaryCodec.encode_file(&file).unwrap();
            let decoded = BinaryCodec.decode_file(&bytes).unwrap();
            prop_assert_eq!(&decoded, &file);
            prop_assert_eq!(BinaryCodec.encode_file(&decoded).unwrap(), bytes);
        }

        #[test]
        fn binary_container_records_are_stable(container in container_strategy()) {
            let bytes = BinaryCodec.encode_container(&container).unwrap();
            let decoded = BinaryCodec.decode_container(&bytes).unwrap();
            prop_assert_eq!(&decoded, &container);
            prop_assert_eq!(BinaryCodec.encode_container(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn codec_is_object_safe() {
        fn _check(_: &dyn Codec) {}
    }
}
