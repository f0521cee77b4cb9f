//! Per-account RSA key lifecycle.
//!
//! Keys are 2048-bit RSA, stored as PKCS#1 DER in the account row. The
//! private half is held in [`PrivateKey`], which zeroizes its buffer on drop,
//! redacts itself in `Debug`, and offers no byte access outside this crate.
//! Only the public half is ever copied into the session cache.
//!
//! Generation is CPU-bound. Callers generate first, with no transaction
//! open, and then persist in one short transaction:
//!
//! ```no_run
//! use touno_core_authn::keys::{generate_keypair_async, persist_keypair};
//! use touno_core_storage::{AccountId, Database, IsolationLevel};
//!
//! # async fn example(db: &dyn Database) -> Result<(), touno_core_authn::AuthError> {
//! let pair = generate_keypair_async().await?;
//!
//! let mut tx = db.begin(IsolationLevel::Default).await?;
//! persist_keypair(tx.as_mut(), AccountId(7), &pair).await?;
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use bytes::Bytes;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand_core::OsRng;
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey},
};
use touno_core_storage::{AccountId, SqlTransaction, StorageError};
use zeroize::Zeroizing;

use crate::{
    error::{AuthError, Result},
    sql,
};

/// RSA modulus size for account keys.
pub const KEY_BITS: usize = 2048;

/// An account's private signing key.
pub struct PrivateKey {
    der: Zeroizing<Vec<u8>>,
    encoding: EncodingKey,
}

impl PrivateKey {
    fn from_der(der: Zeroizing<Vec<u8>>) -> Self {
        let encoding = EncodingKey::from_rsa_der(&der);
        Self { der, encoding }
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub(crate) fn der(&self) -> &[u8] {
        &self.der
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// An account's public verification key.
#[derive(Clone)]
pub struct PublicKey {
    der: Bytes,
    decoding: DecodingKey,
}

impl PublicKey {
    fn from_der(der: Bytes) -> Self {
        let decoding = DecodingKey::from_rsa_der(&der);
        Self { der, decoding }
    }

    /// PKCS#1 DER encoding, as stored in the account row and the cache.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.der
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey").field("der_len", &self.der.len()).finish()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

/// A freshly generated key pair.
#[derive(Debug)]
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// The public half.
    #[must_use]
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn private(&self) -> &PrivateKey {
        &self.private
    }
}

/// Generates a fresh RSA-2048 key pair from the OS random source.
///
/// Blocks the calling thread for tens to hundreds of milliseconds; async
/// callers should use [`generate_keypair_async`].
///
/// # Errors
///
/// Returns [`AuthError::KeyGeneration`] if the entropy source or encoding
/// fails.
pub fn generate_keypair() -> Result<KeyPair> {
    let key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
        .map_err(|e| AuthError::key_generation(e.to_string()))?;
    let private_der =
        key.to_pkcs1_der().map_err(|e| AuthError::key_generation(format!("encode private: {e}")))?;
    let public_der = RsaPublicKey::from(&key)
        .to_pkcs1_der()
        .map_err(|e| AuthError::key_generation(format!("encode public: {e}")))?;

    Ok(KeyPair {
        private: PrivateKey::from_der(Zeroizing::new(private_der.as_bytes().to_vec())),
        public: PublicKey::from_der(Bytes::copy_from_slice(public_der.as_bytes())),
    })
}

/// Runs [`generate_keypair`] on the blocking thread pool.
///
/// # Errors
///
/// Returns [`AuthError::KeyGeneration`] if generation fails or the blocking
/// task panics.
///
/// # Panics
///
/// Must be called within a Tokio runtime context.
#[tracing::instrument]
pub async fn generate_keypair_async() -> Result<KeyPair> {
    tokio::task::spawn_blocking(generate_keypair)
        .await
        .map_err(|e| AuthError::key_generation(format!("key generation task failed: {e}")))?
}

/// Writes both halves of `pair` to the account row inside `tx`.
///
/// # Errors
///
/// Returns [`AuthError::Storage`] if the update fails, or wrapping
/// [`StorageError::NoRows`] if no account has this id. The caller must roll
/// back.
#[tracing::instrument(skip(tx, pair))]
pub async fn persist_keypair(
    tx: &mut dyn SqlTransaction,
    account: AccountId,
    pair: &KeyPair,
) -> Result<()> {
    let updated = tx
        .execute(
            &sql::ACCOUNT_UPDATE_KEYS,
            &[account.into(), pair.private.der().into(), pair.public.as_bytes().into()],
        )
        .await?;
    if updated == 0 {
        return Err(StorageError::no_rows().into());
    }
    Ok(())
}

/// Decodes a stored PKCS#1 DER private key.
///
/// # Errors
///
/// Returns [`AuthError::KeyDecode`] if the bytes are not a valid RSA
/// private key.
pub fn load_private_key(der: &[u8]) -> Result<PrivateKey> {
    RsaPrivateKey::from_pkcs1_der(der).map_err(|e| AuthError::key_decode(e.to_string()))?;
    Ok(PrivateKey::from_der(Zeroizing::new(der.to_vec())))
}

/// Decodes a PKCS#1 DER public key, as held in the session cache.
///
/// # Errors
///
/// Returns [`AuthError::KeyDecode`] if the bytes are not a valid RSA public
/// key.
pub fn decode_public_key(der: &[u8]) -> Result<PublicKey> {
    RsaPublicKey::from_pkcs1_der(der).map_err(|e| AuthError::key_decode(e.to_string()))?;
    Ok(PublicKey::from_der(Bytes::copy_from_slice(der)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::testutil::{test_keypair, test_keypair_alt};

    #[test]
    fn test_generated_pair_round_trips_through_storage_encoding() {
        let pair = test_keypair();

        let private = load_private_key(pair.private().der()).expect("private decodes");
        let public = decode_public_key(pair.public().as_bytes()).expect("public decodes");

        assert_eq!(private.der(), pair.private().der());
        assert_eq!(&public, pair.public());
    }

    #[test]
    fn test_generated_keys_are_distinct() {
        assert_ne!(test_keypair().public(), test_keypair_alt().public());
    }

    #[test]
    fn test_load_private_key_rejects_garbage() {
        let result = load_private_key(b"not a key");
        assert!(matches!(result, Err(AuthError::KeyDecode { .. })));
    }

    #[test]
    fn test_public_key_is_not_a_private_key() {
        let result = load_private_key(test_keypair().public().as_bytes());
        assert!(matches!(result, Err(AuthError::KeyDecode { .. })));
    }

    #[test]
    fn test_decode_public_key_rejects_truncated_der() {
        let der = test_keypair().public().as_bytes();
        let result = decode_public_key(&der[..der.len() / 2]);
        assert!(matches!(result, Err(AuthError::KeyDecode { .. })));
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let rendered = format!("{:?}", test_keypair());
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("der:"), "raw key bytes leaked: {rendered}");
    }

    #[tokio::test]
    async fn test_generate_keypair_async_produces_usable_pair() {
        let pair = generate_keypair_async().await.expect("generation");
        decode_public_key(pair.public().as_bytes()).expect("public decodes");
        load_private_key(pair.private().der()).expect("private decodes");
    }
}
