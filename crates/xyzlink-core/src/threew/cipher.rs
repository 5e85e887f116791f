//! Body ciphers
//!
//! Bodies are processed in independent 8208-byte units. ECB needs no state
//! between units; the legacy CBC variant restarts from a zero IV in every unit.

use aes::cipher::{
    block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit,
};

use super::{ContainerError, CIPHER_UNIT};

type Aes256EcbEnc = ecb::Encryptor<aes::Aes256>;
type Aes256EcbDec = ecb::Decryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
#[cfg(test)]
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

/// AES-256 key for ECB bodies
const ECB_KEY: &[u8; 32] = b"@xyzprinting.com@xyzprinting.com";

/// AES-128 key for legacy CBC bodies
const CBC_KEY: &[u8; 16] = b"@xyzprinting.com";

const ZERO_IV: [u8; 16] = [0u8; 16];

/// AES block size
pub const AES_BLOCK: usize = 16;

fn cipher_err(e: impl std::fmt::Display) -> ContainerError {
    ContainerError::Cipher(e.to_string())
}

/// Encrypt a block-aligned buffer in place with AES-256-ECB
pub fn ecb_encrypt(buf: &mut [u8]) -> Result<(), ContainerError> {
    let len = buf.len();
    Aes256EcbEnc::new_from_slice(ECB_KEY)
        .map_err(cipher_err)?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(cipher_err)?;
    Ok(())
}

/// Decrypt a block-aligned buffer in place with AES-256-ECB
pub fn ecb_decrypt(buf: &mut [u8]) -> Result<(), ContainerError> {
    Aes256EcbDec::new_from_slice(ECB_KEY)
        .map_err(cipher_err)?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(cipher_err)?;
    Ok(())
}

/// Decrypt a legacy body, restarting CBC from a zero IV in each unit
pub fn cbc_decrypt_units(buf: &mut [u8]) -> Result<(), ContainerError> {
    for unit in buf.chunks_mut(CIPHER_UNIT) {
        Aes128CbcDec::new_from_slices(CBC_KEY, &ZERO_IV)
            .map_err(cipher_err)?
            .decrypt_padded_mut::<NoPadding>(unit)
            .map_err(cipher_err)?;
    }
    Ok(())
}

/// Counterpart of [`cbc_decrypt_units`], used to build legacy fixtures
#[cfg(test)]
pub fn cbc_encrypt_units(buf: &mut [u8]) -> Result<(), ContainerError> {
    for unit in buf.chunks_mut(CIPHER_UNIT) {
        let len = unit.len();
        Aes128CbcEnc::new_from_slices(CBC_KEY, &ZERO_IV)
            .map_err(cipher_err)?
            .encrypt_padded_mut::<NoPadding>(unit, len)
            .map_err(cipher_err)?;
    }
    Ok(())
}

/// Append PKCS7 padding (always 1-16 bytes)
pub fn pkcs7_pad(data: &mut Vec<u8>) {
    let pad = AES_BLOCK - data.len() % AES_BLOCK;
    data.resize(data.len() + pad, pad as u8);
}

/// Length of `data` once PKCS7 padding is removed
pub fn pkcs7_unpadded_len(data: &[u8]) -> Result<usize, ContainerError> {
    let Some(&pad) = data.last() else {
        return Err(ContainerError::Truncated("no padded data".to_string()));
    };
    if pad == 0 || pad as usize > AES_BLOCK || pad as usize > data.len() {
        return Err(ContainerError::InvalidPadding(pad));
    }
    let body = data.len() - pad as usize;
    if data[body..].iter().any(|b| *b != pad) {
        return Err(ContainerError::InvalidPadding(pad));
    }
    Ok(body)
}
