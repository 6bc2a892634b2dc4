/// Legacy shared-secret encryption for direct messages.
///
/// The shared key is the x-coordinate of the ECDH point between the local
/// secret key and the counterparty's (even-parity) public key. Content is
/// encrypted with AES-256-CBC and carried as `base64(ciphertext)?iv=base64(iv)`.
use crate::error::{Result, SyncError};
use crate::identity::{Keys, PublicKey};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use secp256k1::{ecdh, Parity, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_SEPARATOR: &str = "?iv=";
const IV_LEN: usize = 16;

fn shared_key(secret: &SecretKey, counterparty: &PublicKey) -> [u8; 32] {
    let point = ecdh::shared_secret_point(&counterparty.as_xonly().public_key(Parity::Even), secret);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    key
}

/// Encrypt `content` from `sender` to `recipient`
pub fn encrypt(content: &str, recipient: &PublicKey, sender: &Keys) -> Result<String> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    encrypt_with_iv(content, recipient, sender, iv)
}

fn encrypt_with_iv(
    content: &str,
    recipient: &PublicKey,
    sender: &Keys,
    iv: [u8; IV_LEN],
) -> Result<String> {
    let key = shared_key(&sender.secret_key(), recipient);
    let cipher = Aes256CbcEnc::new(&key.into(), &iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(content.as_bytes());

    Ok(format!(
        "{}{}{}",
        BASE64.encode(ciphertext),
        IV_SEPARATOR,
        BASE64.encode(iv)
    ))
}

/// Decrypt a payload written by `sender` with the recipient's secret key.
///
/// Any failure (malformed payload, wrong keys, non-UTF-8 plaintext) is a
/// `Decryption` error; callers treat it as "message unreadable".
pub fn decrypt(ciphertext: &str, sender: &PublicKey, recipient_secret: &SecretKey) -> Result<String> {
    let (data_b64, iv_b64) = ciphertext
        .split_once(IV_SEPARATOR)
        .ok_or_else(|| SyncError::Decryption("missing iv".to_string()))?;

    let data = BASE64
        .decode(data_b64)
        .map_err(|e| SyncError::Decryption(format!("invalid ciphertext base64: {}", e)))?;
    let iv = BASE64
        .decode(iv_b64)
        .map_err(|e| SyncError::Decryption(format!("invalid iv base64: {}", e)))?;
    let iv: [u8; IV_LEN] = iv
        .try_into()
        .map_err(|_| SyncError::Decryption("iv must be 16 bytes".to_string()))?;

    let key = shared_key(recipient_secret, sender);
    let cipher = Aes256CbcDec::new(&key.into(), &iv.into());
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&data)
        .map_err(|e| SyncError::Decryption(format!("bad padding: {}", e)))?;

    String::from_utf8(plaintext)
        .map_err(|e| SyncError::Decryption(format!("plaintext is not utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_between_two_keys() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let ciphertext = encrypt("meet at the pier", &bob.public_key(), &alice).unwrap();
        assert!(ciphertext.contains("?iv="));
        assert!(!ciphertext.contains("pier"));

        let plaintext = decrypt(&ciphertext, &alice.public_key(), &bob.secret_key()).unwrap();
        assert_eq!(plaintext, "meet at the pier");

        // the sender can read their own message back
        let own = decrypt(&ciphertext, &bob.public_key(), &alice.secret_key()).unwrap();
        assert_eq!(own, "meet at the pier");
    }

    fn fixed_keys(byte: &str) -> Keys {
        Keys::from_secret_hex(&byte.repeat(32)).unwrap()
    }

    #[test]
    fn test_decrypt_with_mismatched_keys_fails() {
        let alice = fixed_keys("11");
        let bob = fixed_keys("22");
        let mallory = fixed_keys("33");

        let ciphertext = encrypt_with_iv(
            "a message long enough to span several cipher blocks of data",
            &bob.public_key(),
            &alice,
            [7u8; IV_LEN],
        )
        .unwrap();
        assert_eq!(
            decrypt(&ciphertext, &alice.public_key(), &bob.secret_key()).unwrap(),
            "a message long enough to span several cipher blocks of data"
        );

        // the wrong shared key leaves a final byte of 0x19, which is not valid padding
        let result = decrypt(&ciphertext, &alice.public_key(), &mallory.secret_key());
        assert!(matches!(result, Err(SyncError::Decryption(_))));
    }

    #[test]
    fn test_decrypt_malformed_payloads() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        for payload in ["", "no-iv-here", "!!!?iv=AAAA", "AAAA?iv=AAAA"] {
            let result = decrypt(payload, &alice.public_key(), &bob.secret_key());
            assert!(matches!(result, Err(SyncError::Decryption(_))), "{payload}");
        }
    }
}
