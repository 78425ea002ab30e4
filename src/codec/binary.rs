//! Binary record layout of the in-memory/changelog backend.
//!
//! Container:
//!
//! ```text
//! id u64 | parent_id u64 | flags u16 | ctime sec u64, nsec u64 | cuid u32 | cgid u32
//! | mode u32 | acl_id u16 | name cstr | attr count u16 | (key cstr, value cstr)*
//! ```
//!
//! The attribute list always ends with `sys.mtime.s` and `sys.mtime.ns`
//! carrying mtime as decimal strings.
//!
//! File:
//!
//! ```text
//! id u64 | ctime 16B | mtime 16B | flags:16 size:48 u64 | container_id u64
//! | name[//link] cstr | u16 n, n × location u32 | u16 n, n × unlinked u32
//! | cuid u32 | cgid u32 | layout_id u32 | checksum u8 len + bytes
//! | [attr count u16 | (key cstr, value cstr)*]
//! ```
//!
//! The trailing attribute list is written only when non-empty.

use std::collections::BTreeMap;

use super::{Buffer, BufferReader, Codec};
use crate::md::{ContainerMd, FileMd};
use crate::types::{MAX_FILE_SIZE, MTIME_NSEC_ATTR, MTIME_SEC_ATTR, Timespec};
use crate::NsError;

const LINK_SEPARATOR: &str = "//";

/// Codec producing the exact changelog byte layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

fn put_timespec(buffer: &mut Buffer, ts: Timespec) {
    buffer.put_u64(ts.sec);
    buffer.put_u64(ts.nsec);
}

fn grab_timespec(reader: &mut BufferReader<'_>) -> Result<Timespec, NsError> {
    Ok(Timespec::new(reader.grab_u64()?, reader.grab_u64()?))
}

fn count_u16(n: usize, what: &str) -> Result<u16, NsError> {
    u16::try_from(n).map_err(|_| NsError::InvalidArgument {
        operation: "encode",
        reason: format!("too many {what}: {n}"),
    })
}

fn put_attributes<'a>(
    buffer: &mut Buffer,
    attributes: impl Iterator<Item = (&'a str, &'a str)>,
) -> Result<(), NsError> {
    for (key, value) in attributes {
        buffer.put_cstr(key)?;
        buffer.put_cstr(value)?;
    }
    Ok(())
}

fn grab_attributes(
    reader: &mut BufferReader<'_>,
) -> Result<BTreeMap<String, String>, NsError> {
    let count = reader.grab_u16()?;
    let mut attributes = BTreeMap::new();
    for _ in 0..count {
        let key = reader.grab_cstr()?;
        let value = reader.grab_cstr()?;
        attributes.insert(key, value);
    }
    Ok(attributes)
}

fn parse_decimal(attributes: &mut BTreeMap<String, String>, key: &str) -> Result<u64, NsError> {
    let raw = attributes
        .remove(key)
        .ok_or_else(|| NsError::corrupted(format!("container record lacks {key}")))?;
    raw.parse()
        .map_err(|_| NsError::corrupted(format!("{key} is not a number: {raw:?}")))
}

impl Codec for BinaryCodec {
    fn encode_file(&self, file: &FileMd) -> Result<Vec<u8>, NsError> {
        let mut buffer = Buffer::with_capacity(128 + file.name().len());
        buffer.put_u64(file.id());
        put_timespec(&mut buffer, file.ctime());
        put_timespec(&mut buffer, file.mtime());
        buffer.put_u64((u64::from(file.flags()) << 48) | (file.size() & MAX_FILE_SIZE));
        buffer.put_u64(file.container_id());

        match file.link() {
            Some(link) => buffer.put_cstr(&format!("{}{LINK_SEPARATOR}{link}", file.name()))?,
            None => buffer.put_cstr(file.name())?,
        }

        buffer.put_u16(count_u16(file.num_locations(), "locations")?);
        for location in file.locations() {
            buffer.put_u32(*location);
        }
        buffer.put_u16(count_u16(file.num_unlinked_locations(), "unlinked locations")?);
        for location in file.unlinked_locations() {
            buffer.put_u32(*location);
        }

        buffer.put_u32(file.cuid());
        buffer.put_u32(file.cgid());
        buffer.put_u32(file.layout_id());

        let checksum = file.checksum();
        let checksum_len = u8::try_from(checksum.len()).map_err(|_| NsError::InvalidArgument {
            operation: "encode",
            reason: format!("checksum of {} bytes exceeds 255", checksum.len()),
        })?;
        buffer.put_u8(checksum_len);
        buffer.put_bytes(checksum);

        if !file.attributes().is_empty() {
            buffer.put_u16(count_u16(file.attributes().len(), "attributes")?);
            put_attributes(
                &mut buffer,
                file.attributes().iter().map(|(k, v)| (k.as_str(), v.as_str())),
            )?;
        }

        Ok(buffer.into_vec())
    }

    fn decode_file(&self, bytes: &[u8]) -> Result<FileMd, NsError> {
        let mut reader = BufferReader::new(bytes);
        let mut file = FileMd::new(reader.grab_u64()?);
        file.set_ctime(grab_timespec(&mut reader)?);
        file.set_mtime(grab_timespec(&mut reader)?);

        let packed = reader.grab_u64()?;
        file.set_flags((packed >> 48) as u16);
        file.set_size(packed & MAX_FILE_SIZE);
        file.set_container_id(reader.grab_u64()?);

        let name = reader.grab_cstr()?;
        match name.split_once(LINK_SEPARATOR) {
            Some((name, link)) => {
                file.set_name(name);
                file.set_link(Some(link.to_string()));
            }
            None => file.set_name(name),
        }

        let count = reader.grab_u16()?;
        for _ in 0..count {
            file.add_location(reader.grab_u32()?);
        }
        let count = reader.grab_u16()?;
        for _ in 0..count {
            let location = reader.grab_u32()?;
            file.add_location(location);
            file.unlink_location(location);
        }

        file.set_cuid(reader.grab_u32()?);
        file.set_cgid(reader.grab_u32()?);
        file.set_layout_id(reader.grab_u32()?);

        let checksum_len = usize::from(reader.grab_u8()?);
        file.set_checksum(reader.grab_bytes(checksum_len)?);

        if reader.remaining() > 0 {
            for (key, value) in grab_attributes(&mut reader)? {
                file.set_attribute(key, value);
            }
        }

        // Decoding is not a mutation.
        file.take_changes();
        Ok(file)
    }

    fn encode_container(&self, container: &ContainerMd) -> Result<Vec<u8>, NsError> {
        let mut buffer = Buffer::with_capacity(96 + container.name().len());
        buffer.put_u64(container.id());
        buffer.put_u64(container.parent_id());
        buffer.put_u16(container.flags());
        put_timespec(&mut buffer, container.ctime());
        buffer.put_u32(container.cuid());
        buffer.put_u32(container.cgid());
        buffer.put_u32(container.mode());
        buffer.put_u16(container.acl_id());
        buffer.put_cstr(container.name())?;

        buffer.put_u16(count_u16(container.attributes().len() + 2, "attributes")?);
        put_attributes(
            &mut buffer,
            container
                .attributes()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        let mtime = container.mtime();
        buffer.put_cstr(MTIME_SEC_ATTR)?;
        buffer.put_cstr(&mtime.sec.to_string())?;
        buffer.put_cstr(MTIME_NSEC_ATTR)?;
        buffer.put_cstr(&mtime.nsec.to_string())?;

        Ok(buffer.into_vec())
    }

    fn decode_container(&self, bytes: &[u8]) -> Result<ContainerMd, NsError> {
        let mut reader = BufferReader::new(bytes);
        let mut container = ContainerMd::new(reader.grab_u64()?);
        container.set_parent_id(reader.grab_u64()?);
        container.set_flags(reader.grab_u16()?);
        container.set_ctime(grab_timespec(&mut reader)?);
        container.set_cuid(reader.grab_u32()?);
        container.set_cgid(reader.grab_u32()?);
        container.set_mode(reader.grab_u32()?);
        container.set_acl_id(reader.grab_u16()?);
        container.set_name(reader.grab_cstr()?);

        let mut attributes = grab_attributes(&mut reader)?;
        let mtime = Timespec::new(
            parse_decimal(&mut attributes, MTIME_SEC_ATTR)?,
            parse_decimal(&mut attributes, MTIME_NSEC_ATTR)?,
        );
        container.set_mtime(mtime);
        container.restore_tmtime(mtime);
        *container.attributes_mut() = attributes;

        if reader.remaining() > 0 {
            return Err(NsError::corrupted(format!(
                "{} trailing bytes after container record",
                reader.remaining()
            )));
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> FileMd {
        let mut file = FileMd::new(42);
        file.set_name("data.bin");
        file.set_container_id(7);
        file.set_size(123_456);
        file.set_flags(0x0a0b);
        file.set_cuid(1000);
        file.set_cgid(100);
        file.set_layout_id(0x0010_0112);
        file.set_checksum(vec![0xde, 0xad, 0xbe, 0xef]);
        file.set_ctime(Timespec::new(1_600_000_000, 5));
        file.set_mtime(Timespec::new(1_600_000_100, 6));
        file.add_location(3);
        file.add_location(4);
        file.add_location(9);
        file.unlink_location(9);
        file.take_changes();
        file
    }

    #[test]
    fn file_header_layout() {
        let bytes = BinaryCodec.encode_file(&sample_file()).unwrap();
        assert_eq!(&bytes[0..8], &42u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &1_600_000_000u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &5u64.to_le_bytes());
        let packed = (0x0a0bu64 << 48) | 123_456;
        assert_eq!(&bytes[40..48], &packed.to_le_bytes());
        assert_eq!(&bytes[48..56], &7u64.to_le_bytes());
        // "data.bin" + NUL
        assert_eq!(&bytes[56..58], &9u16.to_le_bytes());
        assert_eq!(&bytes[58..67], b"data.bin\0");
    }

    #[test]
    fn file_round_trip() {
        let file = sample_file();
        let bytes = BinaryCodec.encode_file(&file).unwrap();
        let decoded = BinaryCodec.decode_file(&bytes).unwrap();
        assert_eq!(decoded, file);
        assert_eq!(decoded.unlinked_locations(), &[9]);
        assert_eq!(BinaryCodec.encode_file(&decoded).unwrap(), bytes);
    }

    #[test]
    fn symlink_target_is_embedded_in_name() {
        let mut file = FileMd::new(1);
        file.set_name("link");
        file.set_link(Some("/a/b//c".into()));
        let bytes = BinaryCodec.encode_file(&file).unwrap();
        let needle = b"link///a/b//c\0";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));

        let decoded = BinaryCodec.decode_file(&bytes).unwrap();
        assert_eq!(decoded.name(), "link");
        assert_eq!(decoded.link(), Some("/a/b//c"));
    }

    #[test]
    fn file_without_attributes_has_no_trailer() {
        let file = FileMd::new(1);
        let bytes = BinaryCodec.encode_file(&file).unwrap();
        // header 56 + name 3 + 2 empty arrays 4 + ids 12 + checksum len 1
        assert_eq!(bytes.len(), 56 + 3 + 4 + 12 + 1);

        let mut with_attr = file.clone();
        with_attr.set_attribute("user.k", "v");
        let longer = BinaryCodec.encode_file(&with_attr).unwrap();
        assert!(longer.len() > bytes.len());
        assert_eq!(BinaryCodec.decode_file(&longer).unwrap(), with_attr);
    }

    #[test]
    fn container_mtime_travels_as_attributes() {
        let mut container = ContainerMd::new(5);
        container.set_parent_id(1);
        container.set_name("docs");
        container.set_mtime(Timespec::new(1_700_000_000, 42));
        container.set_attribute("user.a", "1").unwrap();

        let bytes = BinaryCodec.encode_container(&container).unwrap();
        for needle in [&b"sys.mtime.s\0"[..], b"1700000000\0", b"sys.mtime.ns\0", b"42\0"] {
            assert!(bytes.windows(needle.len()).any(|w| w == needle));
        }

        let decoded = BinaryCodec.decode_container(&bytes).unwrap();
        assert_eq!(decoded.mtime(), Timespec::new(1_700_000_000, 42));
        assert_eq!(decoded.tmtime(), decoded.mtime());
        assert_eq!(decoded.attributes().len(), 1);
        assert!(!decoded.has_attribute(MTIME_SEC_ATTR));
    }

    #[test]
    fn container_header_layout() {
        let mut container = ContainerMd::new(5);
        container.set_parent_id(1);
        container.set_flags(1);
        container.set_ctime(Timespec::new(10, 20));
        container.set_cuid(7);
        container.set_cgid(8);
        container.set_mode(0o040700);
        container.set_acl_id(3);
        let bytes = BinaryCodec.encode_container(&container).unwrap();
        assert_eq!(&bytes[0..8], &5u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &1u64.to_le_bytes());
        assert_eq!(&bytes[16..18], &1u16.to_le_bytes());
        assert_eq!(&bytes[18..26], &10u64.to_le_bytes());
        assert_eq!(&bytes[26..34], &20u64.to_le_bytes());
        assert_eq!(&bytes[34..38], &7u32.to_le_bytes());
        assert_eq!(&bytes[38..42], &8u32.to_le_bytes());
        assert_eq!(&bytes[42..46], &0o040700u32.to_le_bytes());
        assert_eq!(&bytes[46..48], &3u16.to_le_bytes());
    }

    #[test]
    fn truncated_container_is_corrupted() {
        let bytes = BinaryCodec.encode_container(&ContainerMd::new(5)).unwrap();
        let err = BinaryCodec.decode_container(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, NsError::Corrupted { .. }));
    }

    #[test]
    fn oversized_checksum_is_refused() {
        let mut file = FileMd::new(1);
        file.set_checksum(vec![0u8; 256]);
        assert!(BinaryCodec.encode_file(&file).is_err());
    }
}
