//! End-to-end payload encryption.
//!
//! Payloads are encrypted with AES-128-CBC under a randomly generated data
//! key. The data key itself is wrapped with RSA-OAEP under each configured
//! recipient public key (supplied by a [`CryptoKeyReader`]) and shipped in
//! the message metadata, so only consumers holding a matching private key
//! can unwrap it. The data key is rotated on a fixed cadence by the
//! producer's refresh task; messages encrypted before a rotation stay
//! readable because their wrapped key travels with them.

use std::sync::{Arc, Mutex};

use aes::Aes128;
use bytes::Bytes;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use cbc::Encryptor;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

use crate::commands::{EncryptionKey, MessageMetadata};
use crate::error::{Error, Result};

/// Name of the cipher stamped into message metadata.
const ENCRYPTION_ALGO: &str = "AES128CBC";

/// Supplies recipient key material for wrapping data keys.
///
/// Implementations typically read PEM files or call out to a KMS. The
/// returned bytes are a PEM-encoded RSA public key (PKCS#8 SPKI or
/// PKCS#1) registered under `key_name`.
pub trait CryptoKeyReader: Send + Sync {
    /// Fetch the public key registered under `key_name`.
    fn public_key(&self, key_name: &str) -> Result<Vec<u8>>;
}

/// A key reader backed by a fixed in-memory map. Primarily for tests and
/// single-tenant deployments.
pub struct StaticKeyReader {
    keys: Vec<(String, Vec<u8>)>,
}

impl StaticKeyReader {
    pub fn new(keys: Vec<(String, Vec<u8>)>) -> Self {
        StaticKeyReader { keys }
    }
}

impl CryptoKeyReader for StaticKeyReader {
    fn public_key(&self, key_name: &str) -> Result<Vec<u8>> {
        self.keys
            .iter()
            .find(|(name, _)| name == key_name)
            .map(|(_, key)| key.clone())
            .ok_or(Error::CryptoError)
    }
}

struct DataKey {
    key: [u8; 16],
    /// The data key wrapped under each configured public key, ready to be
    /// stamped into metadata.
    wrapped: Vec<EncryptionKey>,
}

/// Per-producer encryption state.
pub struct MessageCrypto {
    key_names: Vec<String>,
    reader: Arc<dyn CryptoKeyReader>,
    data_key: Mutex<DataKey>,
}

impl MessageCrypto {
    /// Create the crypto state and generate the initial data key.
    pub fn new(key_names: Vec<String>, reader: Arc<dyn CryptoKeyReader>) -> Result<Self> {
        let data_key = Self::generate_data_key(&key_names, reader.as_ref())?;
        Ok(MessageCrypto {
            key_names,
            reader,
            data_key: Mutex::new(data_key),
        })
    }

    fn generate_data_key(key_names: &[String], reader: &dyn CryptoKeyReader) -> Result<DataKey> {
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);

        let mut wrapped = Vec::with_capacity(key_names.len());
        for name in key_names {
            let public_key_pem = reader.public_key(name)?;
            wrapped.push(EncryptionKey {
                key: name.clone(),
                value: Bytes::from(wrap_key(&key, &public_key_pem)?),
            });
        }
        Ok(DataKey { key, wrapped })
    }

    /// Rotate the data key. Messages encrypted before the rotation remain
    /// readable because their wrapped key travels with them.
    pub fn refresh_data_key(&self) -> Result<()> {
        let fresh = Self::generate_data_key(&self.key_names, self.reader.as_ref())?;
        *self.data_key.lock().expect("crypto lock poisoned") = fresh;
        tracing::debug!("Rotated message encryption data key");
        Ok(())
    }

    /// Encrypt `payload` and stamp the wrapped keys and IV into
    /// `metadata`.
    pub fn encrypt(&self, metadata: &mut MessageMetadata, payload: &Bytes) -> Result<Bytes> {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let data_key = self.data_key.lock().expect("crypto lock poisoned");
        let encryptor = Encryptor::<Aes128>::new((&data_key.key).into(), (&iv).into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(payload);

        metadata.encryption_keys = data_key.wrapped.clone();
        metadata.encryption_algo = Some(ENCRYPTION_ALGO.to_string());
        metadata.encryption_param = Some(Bytes::copy_from_slice(&iv));
        Ok(Bytes::from(ciphertext))
    }
}

/// Wrap the data key with RSA-OAEP (SHA-256) under a PEM-encoded public
/// key. Only the holder of the matching private key can unwrap it.
fn wrap_key(data_key: &[u8; 16], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    let pem = std::str::from_utf8(public_key_pem).map_err(|_| {
        tracing::error!("Encryption public key is not valid PEM text");
        Error::CryptoError
    })?;
    let public_key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|error| {
            tracing::error!(%error, "Failed to parse encryption public key");
            Error::CryptoError
        })?;
    public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data_key)
        .map_err(|error| {
            tracing::error!(%error, "Failed to wrap data key");
            Error::CryptoError
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbc::cipher::BlockDecryptMut;
    use cbc::Decryptor;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::RsaPrivateKey;

    fn key_pair() -> (RsaPrivateKey, Vec<u8>) {
        let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate key");
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public key")
            .into_bytes();
        (private_key, public_pem)
    }

    fn crypto_with(public_pem: Vec<u8>) -> MessageCrypto {
        MessageCrypto::new(
            vec!["key-a".into()],
            Arc::new(StaticKeyReader::new(vec![("key-a".into(), public_pem)])),
        )
        .unwrap()
    }

    #[test]
    fn test_encrypt_stamps_metadata() {
        let (_, public_pem) = key_pair();
        let crypto = crypto_with(public_pem);
        let mut metadata = MessageMetadata::default();
        let ciphertext = crypto
            .encrypt(&mut metadata, &Bytes::from_static(b"secret"))
            .unwrap();

        assert_ne!(ciphertext.as_ref(), b"secret");
        assert_eq!(metadata.encryption_algo.as_deref(), Some("AES128CBC"));
        assert_eq!(metadata.encryption_keys.len(), 1);
        assert_eq!(metadata.encryption_keys[0].key, "key-a");
        // RSA-2048 ciphertext.
        assert_eq!(metadata.encryption_keys[0].value.len(), 256);
        assert_eq!(metadata.encryption_param.as_ref().unwrap().len(), 16);
    }

    #[test]
    fn test_private_key_holder_can_decrypt_end_to_end() {
        let (private_key, public_pem) = key_pair();
        let crypto = crypto_with(public_pem);
        let mut metadata = MessageMetadata::default();
        let plaintext = Bytes::from_static(b"round trip through wrap and unwrap");
        let ciphertext = crypto.encrypt(&mut metadata, &plaintext).unwrap();

        // Unwrap the data key with the private key, then decrypt the
        // payload with it and the IV from the metadata.
        let unwrapped = private_key
            .decrypt(Oaep::new::<Sha256>(), &metadata.encryption_keys[0].value)
            .expect("unwrap data key");
        let data_key: [u8; 16] = unwrapped.as_slice().try_into().expect("16-byte data key");

        let iv: [u8; 16] = metadata
            .encryption_param
            .unwrap()
            .as_ref()
            .try_into()
            .expect("16-byte IV");
        let decryptor = Decryptor::<Aes128>::new((&data_key).into(), (&iv).into());
        let decrypted = decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .expect("decrypt payload");
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_ciphertext_is_padded_to_block_size() {
        let (_, public_pem) = key_pair();
        let crypto = crypto_with(public_pem);
        let mut metadata = MessageMetadata::default();
        let ciphertext = crypto
            .encrypt(&mut metadata, &Bytes::from_static(b"0123456789abcdef"))
            .unwrap();
        // Pkcs7 always adds a full block when the input is block-aligned.
        assert_eq!(ciphertext.len(), 32);
    }

    #[test]
    fn test_refresh_changes_wrapped_key() {
        let (_, public_pem) = key_pair();
        let crypto = crypto_with(public_pem);
        let before = crypto.data_key.lock().unwrap().wrapped[0].value.clone();
        crypto.refresh_data_key().unwrap();
        let after = crypto.data_key.lock().unwrap().wrapped[0].value.clone();
        assert_ne!(before, after);
    }

    #[test]
    fn test_unknown_key_name_fails() {
        let result =
            MessageCrypto::new(vec!["missing".into()], Arc::new(StaticKeyReader::new(vec![])));
        assert!(result.is_err());
    }

    #[test]
    fn test_garbage_public_key_fails() {
        let result = MessageCrypto::new(
            vec!["key-a".into()],
            Arc::new(StaticKeyReader::new(vec![(
                "key-a".into(),
                b"not a pem key".to_vec(),
            )])),
        );
        assert_eq!(result.err(), Some(Error::CryptoError));
    }
}
