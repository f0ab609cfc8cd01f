//! ChaCha20-Poly1305 AEAD encryption for pairing payloads and session frames.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hap_core::error::CryptoError;
use zeroize::ZeroizeOnDrop;

/// Largest plaintext carried by one frame.
pub const MAX_FRAME_PLAINTEXT: usize = 0x400;

/// Length prefix plus Poly1305 tag.
pub const FRAME_OVERHEAD: usize = 2 + TAG_LEN;

const TAG_LEN: usize = 16;

/// Session cipher with one key and one nonce counter per direction.
///
/// Each frame is `[u16_le len][ciphertext][16-byte tag]` with AAD = len.
/// Counters start at zero and advance only after a frame is successfully
/// sealed or opened, so a rejected frame never consumes a nonce.
#[derive(ZeroizeOnDrop)]
pub struct FrameCipher {
    encrypt_key: [u8; 32],
    decrypt_key: [u8; 32],
    #[zeroize(skip)]
    encrypt_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    decrypt_cipher: ChaCha20Poly1305,
    #[zeroize(skip)]
    encrypt_counter: u64,
    #[zeroize(skip)]
    decrypt_counter: u64,
}

impl FrameCipher {
    /// Create cipher with the outbound and inbound keys.
    pub fn new(encrypt_key: [u8; 32], decrypt_key: [u8; 32]) -> Self {
        Self {
            encrypt_cipher: ChaCha20Poly1305::new(&encrypt_key.into()),
            decrypt_cipher: ChaCha20Poly1305::new(&decrypt_key.into()),
            encrypt_key,
            decrypt_key,
            encrypt_counter: 0,
            decrypt_counter: 0,
        }
    }

    /// Encrypt plaintext into as many frames as needed.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let frames = plaintext.len().div_ceil(MAX_FRAME_PLAINTEXT);
        let mut out = Vec::with_capacity(plaintext.len() + frames * FRAME_OVERHEAD);
        self.encrypt_into(plaintext, &mut out)?;
        Ok(out)
    }

    /// Encrypt plaintext, appending frames to `out`.
    pub fn encrypt_into(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        for block in plaintext.chunks(MAX_FRAME_PLAINTEXT) {
            let next = self
                .encrypt_counter
                .checked_add(1)
                .ok_or(CryptoError::NonceExhausted)?;

            let aad = (block.len() as u16).to_le_bytes();
            let nonce = build_nonce_from_counter(self.encrypt_counter);
            let payload = Payload { msg: block, aad: &aad };

            let ciphertext_with_tag = self
                .encrypt_cipher
                .encrypt(Nonce::from_slice(&nonce), payload)
                .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))?;

            out.extend_from_slice(&aad);
            out.extend_from_slice(&ciphertext_with_tag);
            self.encrypt_counter = next;
        }
        Ok(())
    }

    /// Decrypt a single frame body (ciphertext followed by tag).
    pub fn decrypt_block(
        &mut self,
        ciphertext_with_tag: &[u8],
        block_len: u16,
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_with_tag.len() != block_len as usize + TAG_LEN {
            return Err(CryptoError::Decryption(
                "Ciphertext block length mismatch".to_string(),
            ));
        }
        let next = self
            .decrypt_counter
            .checked_add(1)
            .ok_or(CryptoError::NonceExhausted)?;

        let aad = block_len.to_le_bytes();
        let nonce = build_nonce_from_counter(self.decrypt_counter);
        let payload = Payload {
            msg: ciphertext_with_tag,
            aad: &aad,
        };

        let plaintext = self
            .decrypt_cipher
            .decrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| CryptoError::Decryption("Decryption/authentication failed".to_string()))?;

        self.decrypt_counter = next;
        Ok(plaintext)
    }

    /// Decrypt a buffer holding only complete frames.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::with_capacity(data.len());
        let mut offset = 0;

        while offset < data.len() {
            let frame_len = match frame_len(&data[offset..])? {
                Some(len) if offset + len <= data.len() => len,
                _ => {
                    return Err(CryptoError::Decryption(
                        "Incomplete ciphertext frame".to_string(),
                    ))
                }
            };
            let block_len = (frame_len - FRAME_OVERHEAD) as u16;
            let plaintext =
                self.decrypt_block(&data[offset + 2..offset + frame_len], block_len)?;
            out.extend_from_slice(&plaintext);
            offset += frame_len;
        }

        Ok(out)
    }

    /// Frames sealed so far.
    pub fn encrypt_counter(&self) -> u64 {
        self.encrypt_counter
    }

    /// Frames opened so far.
    pub fn decrypt_counter(&self) -> u64 {
        self.decrypt_counter
    }

    #[cfg(test)]
    fn set_counters(&mut self, encrypt: u64, decrypt: u64) {
        self.encrypt_counter = encrypt;
        self.decrypt_counter = decrypt;
    }
}

/// Total length of the frame at the start of `buf`, once its prefix is known.
///
/// Returns `Ok(None)` while fewer than two bytes are buffered and an error if
/// the declared length exceeds [`MAX_FRAME_PLAINTEXT`].
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, CryptoError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    if len > MAX_FRAME_PLAINTEXT {
        return Err(CryptoError::Decryption(format!(
            "Frame length {} exceeds {}",
            len, MAX_FRAME_PLAINTEXT
        )));
    }
    Ok(Some(len + FRAME_OVERHEAD))
}

/// Build 12-byte nonce from counter.
fn build_nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt with explicit 12-byte nonce (for pairing protocols).
///
/// Returns ciphertext with 16-byte auth tag appended.
pub fn encrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());

    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(format!("Encryption failed: {}", e)))
}

/// Decrypt with explicit 12-byte nonce (for pairing protocols).
///
/// Expects ciphertext with 16-byte auth tag appended.
pub fn decrypt_with_nonce(
    key: &[u8; 32],
    nonce: &[u8; 12],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption(
            "Ciphertext too short (missing tag)".to_string(),
        ));
    }

    let cipher = ChaCha20Poly1305::new(key.into());

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption("Decryption/authentication failed".to_string()))
}

/// Create a 12-byte nonce from a string (right-aligned, left-padded with zeros).
///
/// HomeKit nonces like "PV-Msg02" become: `\x00\x00\x00\x00PV-Msg02`
pub fn nonce_from_string(s: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    let len = s.len().min(12);
    nonce[12 - len..].copy_from_slice(&s[..len]);
    nonce
}
