//! .3w Container Codec
//!
//! The printer only accepts g-code wrapped in its encrypted `.3w` container.
//!
//! Encoding pads the g-code with PKCS7, zero-fills it to whole 8208-byte cipher
//! units, encrypts with AES-256-ECB and prepends an 8192-byte header. Decoding
//! additionally accepts plaintext bodies and the legacy AES-128-CBC variant
//! whose plaintext is a zip archive holding the g-code.

mod cipher;
mod error;
mod header;

pub use error::ContainerError;
pub use header::{EncryptionTag, Header, HEADER_SIZE, MAGIC};

use std::io::{Cursor, Read};
use std::path::Path;

/// Independent encryption unit: one transfer block plus one AES block of padding room
pub const CIPHER_UNIT: usize = 8208;

/// Wrap raw g-code in a `.3w` container
pub fn encode(gcode: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let mut body = gcode.to_vec();
    cipher::pkcs7_pad(&mut body);

    let units = body.len().div_ceil(CIPHER_UNIT);
    body.resize(units * CIPHER_UNIT, 0);
    cipher::ecb_encrypt(&mut body)?;

    let mut container = Header::write(body.len());
    container.extend_from_slice(&body);

    tracing::debug!(
        gcode_bytes = gcode.len(),
        container_bytes = container.len(),
        "encoded container"
    );
    Ok(container)
}

/// Extract the g-code from a `.3w` container
pub fn decode(container: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let header = Header::parse(container)?;
    let body = &container[HEADER_SIZE..];

    // Only untagged containers may carry a plaintext body; ciphertext can start with ';' too
    if matches!(header.tag, EncryptionTag::Unknown(_)) && body.first() == Some(&b';') {
        tracing::debug!("container body is plaintext");
        return Ok(body.to_vec());
    }

    if (body.len() as u64) < header.body_size as u64 {
        return Err(ContainerError::Truncated(format!(
            "header declares {} body bytes, have {}",
            header.body_size,
            body.len()
        )));
    }
    if body.is_empty() || body.len() % cipher::AES_BLOCK != 0 {
        return Err(ContainerError::Truncated(format!(
            "body length {} is not a whole number of cipher blocks",
            body.len()
        )));
    }

    match header.tag {
        EncryptionTag::ZipCbc128 => decode_zip_cbc(body),
        EncryptionTag::Ecb256 | EncryptionTag::Unknown(_) => decode_ecb(body),
    }
}

fn decode_ecb(body: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let mut plain = body.to_vec();
    cipher::ecb_decrypt(&mut plain)?;

    // Zero-fill sits after the PKCS7 padding, whose bytes are never zero
    let filled = plain.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    if filled == 0 {
        return Err(ContainerError::InvalidPadding(0));
    }
    plain.truncate(filled);

    let len = cipher::pkcs7_unpadded_len(&plain)?;
    plain.truncate(len);
    Ok(plain)
}

fn decode_zip_cbc(body: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let mut plain = body.to_vec();
    cipher::cbc_decrypt_units(&mut plain)?;

    let len = cipher::pkcs7_unpadded_len(&plain)?;
    plain.truncate(len);

    let mut archive = zip::ZipArchive::new(Cursor::new(plain))?;
    if archive.is_empty() {
        return Err(ContainerError::EmptyArchive);
    }
    let mut member = archive.by_index(0)?;
    tracing::debug!(member = member.name(), "legacy zip container");

    // The member size comes from the archive and is not trusted for allocation
    let mut gcode = Vec::new();
    member.read_to_end(&mut gcode)?;
    Ok(gcode)
}

/// Whether `data` starts with the container magic
pub fn is_container(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Encode a g-code file into a container file
pub fn encode_file(input: &Path, output: &Path) -> Result<usize, ContainerError> {
    let container = encode(&std::fs::read(input)?)?;
    std::fs::write(output, &container)?;
    Ok(container.len())
}

/// Decode a container file into a g-code file
pub fn decode_file(input: &Path, output: &Path) -> Result<usize, ContainerError> {
    let gcode = decode(&std::fs::read(input)?)?;
    std::fs::write(output, &gcode)?;
    Ok(gcode.len())
}
