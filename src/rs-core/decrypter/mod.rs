//! AES-128-CBC decryption of HLS segments.

use aes::Aes128;
use bytes::Bytes;
use cbc::{
    cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit},
    Decryptor,
};

use crate::{
    error::DecryptionError,
    host::{DecryptedMessage, DecryptionMessage},
};

#[cfg(not(target_arch = "wasm32"))]
mod worker;

#[cfg(not(target_arch = "wasm32"))]
pub use worker::DecryptionWorker;

/// AES block size in bytes.
const AES_BLOCK_SIZE: usize = 16;

/// Convert the body of a key request into an AES-128 key.
pub fn key_from_bytes(data: &[u8]) -> Result<[u8; 16], DecryptionError> {
    <[u8; 16]>::try_from(data).map_err(|_| DecryptionError::InvalidKeyLength(data.len()))
}

/// Initialization vector used for a segment whose key announces none: its media sequence
/// number as a big-endian 128 bits integer.
pub fn segment_iv(media_sequence: u64) -> [u8; 16] {
    u128::from(media_sequence).to_be_bytes()
}

/// Decrypt a whole AES-128-CBC payload and remove its PKCS7 padding.
pub fn decrypt_aes128_cbc(
    encrypted: &[u8],
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Bytes, DecryptionError> {
    if encrypted.is_empty() || encrypted.len() % AES_BLOCK_SIZE != 0 {
        return Err(DecryptionError::InvalidPayloadLength(encrypted.len()));
    }
    let mut buf = encrypted.to_vec();
    let decryptor = Decryptor::<Aes128>::new(key.into(), iv.into());
    let len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| DecryptionError::InvalidPadding)?
        .len();
    buf.truncate(len);
    Ok(Bytes::from(buf))
}

/// Process one message the way the decryption worker does.
pub fn decrypt_message(message: DecryptionMessage) -> DecryptedMessage {
    let decrypted = decrypt_aes128_cbc(&message.encrypted, &message.key, &message.iv);
    if let Err(err) = decrypted.as_ref() {
        tracing::warn!("Req: decryption of {} failed: {err}", message.source);
    }
    DecryptedMessage {
        source: message.source,
        decrypted,
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::encrypt;
    use super::*;
    use rstest::rstest;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    #[rstest]
    #[case(b"".as_slice())]
    #[case(b"short".as_slice())]
    #[case(b"exactly 16 bytes".as_slice())]
    #[case(&[0x47u8; 188 * 7])]
    fn decrypts_what_was_encrypted(#[case] plaintext: &[u8]) {
        let iv = segment_iv(42);
        let encrypted = encrypt(plaintext, &KEY, &iv);
        let decrypted = decrypt_aes128_cbc(&encrypted, &KEY, &iv).expect("valid payload");
        assert_eq!(&decrypted[..], plaintext);
    }

    #[test]
    fn rejects_unaligned_payloads() {
        assert_eq!(
            decrypt_aes128_cbc(&[0; 17], &KEY, &[0; 16]),
            Err(DecryptionError::InvalidPayloadLength(17))
        );
        assert_eq!(
            decrypt_aes128_cbc(&[], &KEY, &[0; 16]),
            Err(DecryptionError::InvalidPayloadLength(0))
        );
    }

    #[test]
    fn wrong_key_breaks_padding() {
        let iv = segment_iv(1);
        let encrypted = encrypt(b"some segment data", &KEY, &iv);
        let result = decrypt_aes128_cbc(&encrypted, b"fedcba9876543210", &iv);
        // a wrong key produces garbage which almost never ends with a valid padding
        assert!(result.map_or(true, |d| &d[..] != b"some segment data"));
    }

    #[rstest]
    #[case(0, [0; 16])]
    #[case(1, { let mut iv = [0; 16]; iv[15] = 1; iv })]
    #[case(0x0102, { let mut iv = [0; 16]; iv[14] = 1; iv[15] = 2; iv })]
    fn derives_iv_from_media_sequence(#[case] seq: u64, #[case] expected: [u8; 16]) {
        assert_eq!(segment_iv(seq), expected);
    }

    #[rstest]
    #[case(16, true)]
    #[case(15, false)]
    #[case(32, false)]
    fn checks_key_length(#[case] len: usize, #[case] valid: bool) {
        let data = vec![7u8; len];
        match key_from_bytes(&data) {
            Ok(key) => {
                assert!(valid);
                assert_eq!(key, [7u8; 16]);
            }
            Err(err) => {
                assert!(!valid);
                assert_eq!(err, DecryptionError::InvalidKeyLength(len));
            }
        }
    }

    #[test]
    fn keeps_source_in_replies() {
        let iv = segment_iv(3);
        let reply = decrypt_message(DecryptionMessage {
            source: 12,
            encrypted: Bytes::from(encrypt(b"payload", &KEY, &iv)),
            key: KEY,
            iv,
        });
        assert_eq!(reply.source, 12);
        assert_eq!(reply.decrypted.as_deref(), Ok(b"payload".as_slice()));
    }
}
