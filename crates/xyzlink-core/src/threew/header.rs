//! Container header
//!
//! Layout of the fixed 8192-byte header region:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0x00 | 12 | magic `3DPFNKG13WTW` |
//! | 0x0D | 1 | version |
//! | 0x10 | 4 | zip offset (big-endian) |
//! | 0x14 + zip offset | 8 | encryption tag (read side) |
//! | 0x20 | 8 | encryption tag (write side, consulted when the read side is unrecognized) |
//! | 0x28 | 4 | total container size (little-endian) |
//! | 0x2C | 4 | body size (little-endian) |
//! | 0x2000 | .. | body |

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::ContainerError;

/// Container magic
pub const MAGIC: &[u8; 12] = b"3DPFNKG13WTW";

/// Size of the header region; the body starts here
pub const HEADER_SIZE: usize = 0x2000;

/// Version byte written by the encoder
pub const VERSION: u8 = 2;

const VERSION_OFFSET: usize = 13;
const ZIP_OFFSET_OFFSET: usize = 16;
const TAG_BASE: usize = 20;
const TAG_WRITE_OFFSET: usize = 0x20;
const TOTAL_SIZE_OFFSET: usize = 0x28;
const BODY_SIZE_OFFSET: usize = 0x2C;
const TAG_LEN: usize = 8;

/// Body encryption mode announced by the header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionTag {
    /// AES-256-ECB over the raw g-code
    Ecb256,
    /// AES-128-CBC over a zip archive (legacy files)
    ZipCbc128,
    /// Unrecognized tag bytes
    Unknown([u8; TAG_LEN]),
}

impl EncryptionTag {
    pub const ECB_256: &'static [u8; TAG_LEN] = b"TagEa256";
    pub const ZIP_CBC_128: &'static [u8; TAG_LEN] = b"TagEa128";

    fn from_bytes(bytes: [u8; TAG_LEN]) -> Self {
        match &bytes {
            b if b == Self::ECB_256 => EncryptionTag::Ecb256,
            b if b == Self::ZIP_CBC_128 => EncryptionTag::ZipCbc128,
            _ => EncryptionTag::Unknown(bytes),
        }
    }
}

/// Tag bytes at `start`; a tag beyond the header region reads as unknown
fn tag_at(header: &[u8], start: usize) -> EncryptionTag {
    let mut tag = [0u8; TAG_LEN];
    if let Some(bytes) = header.get(start..start.saturating_add(TAG_LEN)) {
        tag.copy_from_slice(bytes);
    }
    EncryptionTag::from_bytes(tag)
}

/// Parsed header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub zip_offset: u32,
    pub tag: EncryptionTag,
    pub total_size: u32,
    pub body_size: u32,
}

impl Header {
    /// Parse the header region of a container
    pub fn parse(data: &[u8]) -> Result<Self, ContainerError> {
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(ContainerError::NotAContainer);
        }
        if data.len() < HEADER_SIZE {
            return Err(ContainerError::Truncated(format!(
                "header needs {HEADER_SIZE} bytes, have {}",
                data.len()
            )));
        }

        let zip_offset = BigEndian::read_u32(&data[ZIP_OFFSET_OFFSET..ZIP_OFFSET_OFFSET + 4]);

        let header = &data[..HEADER_SIZE];
        let tag = match tag_at(header, TAG_BASE.saturating_add(zip_offset as usize)) {
            // Headers written by `write` carry the tag at the fixed write position
            EncryptionTag::Unknown(raw) => match tag_at(header, TAG_WRITE_OFFSET) {
                EncryptionTag::Unknown(_) => EncryptionTag::Unknown(raw),
                known => known,
            },
            known => known,
        };

        Ok(Self {
            version: data[VERSION_OFFSET],
            zip_offset,
            tag,
            total_size: LittleEndian::read_u32(&data[TOTAL_SIZE_OFFSET..TOTAL_SIZE_OFFSET + 4]),
            body_size: LittleEndian::read_u32(&data[BODY_SIZE_OFFSET..BODY_SIZE_OFFSET + 4]),
        })
    }

    /// Build the header region for an ECB body of `body_size` bytes
    pub fn write(body_size: usize) -> Vec<u8> {
        let mut header = vec![0u8; HEADER_SIZE];
        header[..MAGIC.len()].copy_from_slice(MAGIC);
        header[VERSION_OFFSET] = VERSION;
        BigEndian::write_u32(&mut header[ZIP_OFFSET_OFFSET..ZIP_OFFSET_OFFSET + 4], 0);
        header[TAG_WRITE_OFFSET..TAG_WRITE_OFFSET + TAG_LEN]
            .copy_from_slice(EncryptionTag::ECB_256);
        LittleEndian::write_u32(
            &mut header[TOTAL_SIZE_OFFSET..TOTAL_SIZE_OFFSET + 4],
            (HEADER_SIZE + body_size) as u32,
        );
        LittleEndian::write_u32(
            &mut header[BODY_SIZE_OFFSET..BODY_SIZE_OFFSET + 4],
            body_size as u32,
        );
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_header_fields() {
        let header = Header::write(8208);
        assert_eq!(header.len(), HEADER_SIZE);
        assert_eq!(&header[..12], MAGIC);
        assert_eq!(header[13], 2);
        assert_eq!(&header[0x20..0x28], b"TagEa256");
        assert_eq!(LittleEndian::read_u32(&header[0x28..0x2C]), 16400);
        assert_eq!(LittleEndian::read_u32(&header[0x2C..0x30]), 8208);
    }

    #[test]
    fn test_parse_reads_tag_relative_to_zip_offset() {
        let mut data = Header::write(0);
        BigEndian::write_u32(&mut data[16..20], 12);
        let parsed = Header::parse(&data).unwrap();
        assert_eq!(parsed.zip_offset, 12);
        assert_eq!(parsed.tag, EncryptionTag::Ecb256);
    }

    #[test]
    fn test_parse_bad_magic() {
        assert!(matches!(
            Header::parse(b"PK\x03\x04 not a container"),
            Err(ContainerError::NotAContainer)
        ));
    }

    #[test]
    fn test_parse_short_header() {
        assert!(matches!(
            Header::parse(&MAGIC[..]),
            Err(ContainerError::Truncated(_))
        ));
    }

    #[test]
    fn test_huge_zip_offset_is_unknown_tag() {
        let mut data = Header::write(0);
        BigEndian::write_u32(&mut data[16..20], u32::MAX);
        data[TAG_WRITE_OFFSET..TAG_WRITE_OFFSET + TAG_LEN].fill(0);
        let parsed = Header::parse(&data).unwrap();
        assert!(matches!(parsed.tag, EncryptionTag::Unknown(_)));
    }

    #[test]
    fn test_written_header_parses_as_ecb() {
        let parsed = Header::parse(&Header::write(8208)).unwrap();
        assert_eq!(parsed.zip_offset, 0);
        assert_eq!(parsed.tag, EncryptionTag::Ecb256);
    }

    #[test]
    fn test_read_side_tag_wins() {
        let mut data = Header::write(0);
        data[TAG_BASE..TAG_BASE + TAG_LEN].copy_from_slice(EncryptionTag::ZIP_CBC_128);
        assert_eq!(Header::parse(&data).unwrap().tag, EncryptionTag::ZipCbc128);
    }
}
