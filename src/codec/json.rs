//! JSON records for document-store backends.

use super::Codec;
use crate::md::{ContainerMd, FileMd};
use crate::NsError;

/// Codec storing each entity as one JSON document.
///
/// Unlike [`BinaryCodec`](super::BinaryCodec) the document carries the
/// derived `tree_size` and `tmtime` fields as well as the child maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_file(&self, file: &FileMd) -> Result<Vec<u8>, NsError> {
        serde_json::to_vec(file).map_err(|e| NsError::InvalidArgument {
            operation: "encode",
            reason: e.to_string(),
        })
    }

    fn decode_file(&self, bytes: &[u8]) -> Result<FileMd, NsError> {
        serde_json::from_slice(bytes).map_err(|e| NsError::corrupted(e.to_string()))
    }

    fn encode_container(&self, container: &ContainerMd) -> Result<Vec<u8>, NsError> {
        serde_json::to_vec(container).map_err(|e| NsError::InvalidArgument {
            operation: "encode",
            reason: e.to_string(),
        })
    }

    fn decode_container(&self, bytes: &[u8]) -> Result<ContainerMd, NsError> {
        serde_json::from_slice(bytes).map_err(|e| NsError::corrupted(e.to_string()))
    }

    fn self_contained(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timespec;

    #[test]
    fn container_document_keeps_derived_fields() {
        let mut container = ContainerMd::new(9);
        container.set_parent_id(1);
        container.set_name("proj");
        container.set_tree_size(4096);
        container.set_tmtime(Timespec::new(5, 5));
        container.add_file("a", 11);
        container.take_child_deltas();

        let bytes = JsonCodec.encode_container(&container).unwrap();
        let decoded = JsonCodec.decode_container(&bytes).unwrap();
        assert_eq!(decoded, container);
        assert_eq!(decoded.tree_size(), 4096);
        assert_eq!(decoded.find_file("a"), Some(11));
    }

    #[test]
    fn garbage_is_corrupted() {
        let err = JsonCodec.decode_file(b"{not json").unwrap_err();
        assert!(matches!(err, NsError::Corrupted { .. }));
    }
}
