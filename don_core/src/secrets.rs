//! Secrets encryptor.
//!
//! Secrets are sealed to a recipient X25519 key (sealed-box style): a fresh
//! ephemeral key agrees a shared secret with the recipient, SHA-256 turns
//! it into an AES-256-GCM key, and the ephemeral public key travels in
//! front of the ciphertext.
//!
//! ```text
//! ciphertext = ephemeral_pub (32) || nonce (12) || aes_gcm(json(secrets))
//! ```
//!
//! Per-node secrets are sealed once per slot under that slot's key, so a
//! node can only ever open its own share.

use crate::error::{DonError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use don_env::NodeSlot;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Length of a public key fingerprint.
pub const FINGERPRINT_BYTES: usize = 8;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const TAG_BYTES: usize = 16;
const HEADER_BYTES: usize = KEY_BYTES + NONCE_BYTES;

/// A flat string-to-string secrets map.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretsMap(BTreeMap<String, String>);

impl SecretsMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Validates an untyped JSON value as a secrets map.
    ///
    /// Only an object whose values are all strings is accepted.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            DonError::InvalidSecretsFormat(format!("expected an object, got {}", value))
        })?;

        let mut map = BTreeMap::new();
        for (name, value) in object {
            match value.as_str() {
                Some(s) => {
                    map.insert(name.clone(), s.to_string());
                }
                None => {
                    return Err(DonError::InvalidSecretsFormat(format!(
                        "secret '{}' must be a string",
                        name
                    )))
                }
            }
        }
        Ok(Self(map))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over secret names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SecretsMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

// Values never reach logs.
impl std::fmt::Debug for SecretsMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Secrets sealed to one recipient key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSecrets {
    /// Fingerprint of the recipient public key
    pub fingerprint: [u8; FINGERPRINT_BYTES],

    /// `ephemeral_pub || nonce || aead ciphertext`
    pub ciphertext: Vec<u8>,
}

/// All sealed secrets carried by one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSecretsBundle {
    /// DON-wide secrets sealed to the DON key (absent when there are none)
    pub don: Option<EncryptedSecrets>,

    /// Per-node secrets, indexed by node slot
    pub per_node: Vec<EncryptedSecrets>,
}

impl EncryptedSecretsBundle {
    /// Returns the number of node slots this bundle was sealed for.
    pub fn node_count(&self) -> usize {
        self.per_node.len()
    }
}

/// Returns the fingerprint of a public key.
pub fn fingerprint(key: &PublicKey) -> [u8; FINGERPRINT_BYTES] {
    let digest = Sha256::digest(key.as_bytes());
    let mut out = [0u8; FINGERPRINT_BYTES];
    out.copy_from_slice(&digest[..FINGERPRINT_BYTES]);
    out
}

/// Parses a hex public key, with or without a `0x` prefix.
pub fn parse_public_key(hex_key: &str) -> Result<PublicKey> {
    let trimmed = hex_key.strip_prefix("0x").unwrap_or(hex_key);
    let bytes = hex::decode(trimmed).map_err(|e| DonError::InvalidPublicKey(e.to_string()))?;
    let array: [u8; KEY_BYTES] = bytes.try_into().map_err(|b: Vec<u8>| {
        DonError::InvalidPublicKey(format!("expected {} bytes, got {}", KEY_BYTES, b.len()))
    })?;
    Ok(PublicKey::from(array))
}

fn derive_aead_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral.as_bytes());
    hasher.update(recipient.as_bytes());
    Zeroizing::new(hasher.finalize().into())
}

/// Seals a secrets map to `recipient`.
pub fn encrypt<R: RngCore + CryptoRng>(
    secrets: &SecretsMap,
    recipient: &PublicKey,
    rng: &mut R,
) -> Result<EncryptedSecrets> {
    let mut ephemeral_bytes = Zeroizing::new([0u8; KEY_BYTES]);
    rng.fill_bytes(ephemeral_bytes.as_mut());
    let ephemeral = StaticSecret::from(*ephemeral_bytes);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_aead_key(shared.as_bytes(), &ephemeral_public, recipient);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| DonError::InvalidPublicKey(e.to_string()))?;

    let mut nonce = [0u8; NONCE_BYTES];
    rng.fill_bytes(&mut nonce);

    let plaintext = Zeroizing::new(
        serde_json::to_vec(secrets).map_err(|e| DonError::InvalidSecretsFormat(e.to_string()))?,
    );
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| DonError::InvalidSecretsFormat("could not seal secrets".into()))?;

    let mut ciphertext = Vec::with_capacity(HEADER_BYTES + sealed.len());
    ciphertext.extend_from_slice(ephemeral_public.as_bytes());
    ciphertext.extend_from_slice(&nonce);
    ciphertext.extend_from_slice(&sealed);

    Ok(EncryptedSecrets {
        fingerprint: fingerprint(recipient),
        ciphertext,
    })
}

/// Opens secrets sealed to the public half of `secret`.
pub fn decrypt(sealed: &EncryptedSecrets, secret: &StaticSecret) -> Result<SecretsMap> {
    let own_public = PublicKey::from(secret);
    if sealed.fingerprint != fingerprint(&own_public) {
        return Err(DonError::DecryptionFailed(
            "sealed for a different key".into(),
        ));
    }
    if sealed.ciphertext.len() < HEADER_BYTES + TAG_BYTES {
        return Err(DonError::DecryptionFailed("ciphertext too short".into()));
    }

    let mut ephemeral = [0u8; KEY_BYTES];
    ephemeral.copy_from_slice(&sealed.ciphertext[..KEY_BYTES]);
    let ephemeral_public = PublicKey::from(ephemeral);
    let nonce = Nonce::from_slice(&sealed.ciphertext[KEY_BYTES..HEADER_BYTES]);

    let shared = secret.diffie_hellman(&ephemeral_public);
    let key = derive_aead_key(shared.as_bytes(), &ephemeral_public, &own_public);
    let cipher = Aes256Gcm::new_from_slice(key.as_ref())
        .map_err(|e| DonError::DecryptionFailed(e.to_string()))?;

    let plaintext = Zeroizing::new(
        cipher
            .decrypt(nonce, &sealed.ciphertext[HEADER_BYTES..])
            .map_err(|_| DonError::DecryptionFailed("authentication failed".into()))?,
    );
    serde_json::from_slice(&plaintext).map_err(|e| DonError::DecryptionFailed(e.to_string()))
}

/// Seals the DON-wide secrets and one per-node share per slot.
pub fn encrypt_bundle<R: RngCore + CryptoRng>(
    don_secrets: &SecretsMap,
    per_node: &[SecretsMap],
    don_key: &PublicKey,
    node_keys: &[PublicKey],
    rng: &mut R,
) -> Result<EncryptedSecretsBundle> {
    if per_node.len() != node_keys.len() {
        return Err(DonError::NodeCountMismatch {
            expected: node_keys.len(),
            actual: per_node.len(),
        });
    }

    let don = if don_secrets.is_empty() {
        None
    } else {
        Some(encrypt(don_secrets, don_key, rng)?)
    };
    let per_node = per_node
        .iter()
        .zip(node_keys)
        .map(|(secrets, key)| encrypt(secrets, key, rng))
        .collect::<Result<Vec<_>>>()?;

    Ok(EncryptedSecretsBundle { don, per_node })
}

/// The secrets one node may read during one execution.
///
/// Built fresh per execution from the node's own keys; there is no view
/// onto other slots' shares.
#[derive(Clone)]
pub struct NodeSecrets {
    slot: NodeSlot,
    values: SecretsMap,
}

impl NodeSecrets {
    /// Opens the DON-wide secrets and this slot's share.
    ///
    /// Per-node values take precedence over DON-wide values of the same
    /// name.
    pub fn open(
        slot: NodeSlot,
        bundle: &EncryptedSecretsBundle,
        don_secret: &StaticSecret,
        node_secret: &StaticSecret,
    ) -> Result<Self> {
        let mut values = match &bundle.don {
            Some(sealed) => decrypt(sealed, don_secret)?,
            None => SecretsMap::new(),
        };

        let share = bundle.per_node.get(slot.index()).ok_or_else(|| {
            DonError::DecryptionFailed(format!("no secrets share for {}", slot))
        })?;
        let own = decrypt(share, node_secret)?;
        for (name, value) in own.0 {
            values.0.insert(name, value);
        }

        Ok(Self { slot, values })
    }

    /// Creates a view directly from plaintext (no sealing involved).
    pub fn from_plain(slot: NodeSlot, values: SecretsMap) -> Self {
        Self { slot, values }
    }

    pub fn slot(&self) -> NodeSlot {
        self.slot
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The secrets as a JSON object, for handing to user code.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .0
                .iter()
                .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
                .collect(),
        )
    }
}

impl std::fmt::Debug for NodeSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSecrets")
            .field("slot", &self.slot)
            .field("names", &self.values)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn keypair(seed: u8) -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::from([seed; 32]);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    fn secrets(pairs: &[(&str, &str)]) -> SecretsMap {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let (secret, public) = keypair(7);
        let plain = secrets(&[("apiKey", "abc123")]);

        let sealed = encrypt(&plain, &public, &mut rng).unwrap();
        assert_eq!(sealed.fingerprint, fingerprint(&public));
        assert!(!sealed.ciphertext.windows(6).any(|w| w == b"abc123"));

        assert_eq!(decrypt(&sealed, &secret).unwrap(), plain);
    }

    #[test]
    fn test_wrong_key_cannot_decrypt() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let (_, public) = keypair(1);
        let (other_secret, _) = keypair(2);

        let sealed = encrypt(&secrets(&[("k", "v")]), &public, &mut rng).unwrap();
        let err = decrypt(&sealed, &other_secret).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    }

    #[test]
    fn test_tampering_detected() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let (secret, public) = keypair(3);

        let mut sealed = encrypt(&secrets(&[("k", "v")]), &public, &mut rng).unwrap();
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0x01;

        assert!(decrypt(&sealed, &secret).is_err());
    }

    #[test]
    fn test_from_json_rejects_non_strings() {
        let ok = serde_json::json!({"a": "1", "b": ""});
        assert_eq!(SecretsMap::from_json(&ok).unwrap().len(), 2);

        for bad in [
            serde_json::json!({"a": 1}),
            serde_json::json!({"a": ["x"]}),
            serde_json::json!({"a": {"b": "c"}}),
            serde_json::json!(["a"]),
        ] {
            let err = SecretsMap::from_json(&bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSecretsFormat);
        }
    }

    #[test]
    fn test_node_isolation() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let (don_secret, don_public) = keypair(100);
        let nodes: Vec<_> = (0..3).map(keypair).collect();
        let node_publics: Vec<_> = nodes.iter().map(|(_, p)| *p).collect();

        let per_node = vec![
            secrets(&[("apiKey", "zero")]),
            secrets(&[("apiKey", "one")]),
            secrets(&[("apiKey", "two")]),
        ];
        let bundle = encrypt_bundle(
            &secrets(&[("shared", "everyone"), ("apiKey", "don-default")]),
            &per_node,
            &don_public,
            &node_publics,
            &mut rng,
        )
        .unwrap();

        let view = NodeSecrets::open(NodeSlot(1), &bundle, &don_secret, &nodes[1].0).unwrap();
        assert_eq!(view.get("apiKey"), Some("one"));
        assert_eq!(view.get("shared"), Some("everyone"));

        // Slot 1's key cannot open slot 2's share.
        let err = NodeSecrets::open(NodeSlot(2), &bundle, &don_secret, &nodes[1].0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecryptionFailed);
    }

    #[test]
    fn test_bundle_count_mismatch() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let (_, don_public) = keypair(5);
        let (_, node_public) = keypair(6);

        let err = encrypt_bundle(
            &SecretsMap::new(),
            &[SecretsMap::new(), SecretsMap::new()],
            &don_public,
            &[node_public],
            &mut rng,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NodeCountMismatch);
    }

    #[test]
    fn test_debug_hides_values() {
        let view = NodeSecrets::from_plain(NodeSlot(0), secrets(&[("apiKey", "hunter2")]));
        let printed = format!("{:?}", view);
        assert!(printed.contains("apiKey"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_parse_public_key() {
        let (_, public) = keypair(8);
        let hex_key = format!("0x{}", hex::encode(public.as_bytes()));
        assert_eq!(parse_public_key(&hex_key).unwrap(), public);
        assert_eq!(parse_public_key(&hex_key[2..]).unwrap(), public);
        assert!(parse_public_key("0x1234").is_err());
    }
}
