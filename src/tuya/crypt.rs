// Payload encryption used by protocol 3.3: AES-128 in ECB mode with
// PKCS#7 padding, keyed by the device's local key.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

const BLOCK: usize = 16;

#[derive(Clone)]
pub struct Cipher(Aes128);

impl Cipher {
    // Returns `None` if the key is not 16 bytes long.

    pub fn new(key: &[u8]) -> Option<Self> {
        Aes128::new_from_slice(key).ok().map(Cipher)
    }

    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let pad = BLOCK - data.len() % BLOCK;
        let mut buf = Vec::with_capacity(data.len() + pad);

        buf.extend_from_slice(data);
        buf.resize(data.len() + pad, pad as u8);

        for block in buf.chunks_exact_mut(BLOCK) {
            self.0.encrypt_block(GenericArray::from_mut_slice(block));
        }
        buf
    }

    // Returns `None` when the data isn't block aligned or the padding
    // is invalid, which is what a wrong key looks like.

    pub fn decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.is_empty() || data.len() % BLOCK != 0 {
            return None;
        }

        let mut buf = data.to_vec();

        for block in buf.chunks_exact_mut(BLOCK) {
            self.0.decrypt_block(GenericArray::from_mut_slice(block));
        }

        let pad = *buf.last()? as usize;

        if pad == 0 || pad > BLOCK || buf[buf.len() - pad..].iter().any(|b| *b as usize != pad) {
            return None;
        }
        buf.truncate(buf.len() - pad);
        Some(buf)
    }
}
