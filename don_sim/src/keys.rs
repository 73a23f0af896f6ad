//! Deterministic key provider for simulation.

use alloy_primitives::Address;
use don_core::address_of;
use don_env::NodeSlot;
use ed25519_dalek::SigningKey;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use x25519_dalek::StaticSecret;

// Salts that keep the key families apart under one master seed.
const WALLET_SALT: u64 = 0;
const NODE_SALT: u64 = 0x3c6ef372fe94f82b;
const DON_SALT: u64 = 0xa54ff53a5f1d36f1;
const TRANSMITTER_SALT: u64 = 0x510e527fade682d1;
const CONSUMER_SALT: u64 = 0x9b05688c2b3e6c1f;

/// Provides every key a simulated deployment needs, derived from one seed.
///
/// Keys are:
/// - Deterministic: same seed always produces the same keys
/// - Unique: each wallet, node and transmitter gets a different key
/// - Isolated: changing the node count doesn't affect other nodes' keys
pub struct DeterministicKeyProvider {
    /// Master seed
    master_seed: u64,

    /// Cache of requester wallets by offset
    wallet_cache: HashMap<u32, SigningKey>,
}

impl DeterministicKeyProvider {
    /// Creates a new key provider with the given master seed.
    pub fn new(master_seed: u64) -> Self {
        Self {
            master_seed,
            wallet_cache: HashMap::new(),
        }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    /// `master_seed * golden + id * prime`, then salted per key family.
    fn rng_for(&self, salt: u64, id: u64) -> ChaCha8Rng {
        let seed = self
            .master_seed
            .wrapping_mul(0x9e3779b97f4a7c15) // Golden ratio prime
            .wrapping_add(id.wrapping_mul(0x517cc1b727220a95))
            ^ salt;
        ChaCha8Rng::seed_from_u64(seed)
    }

    /// Generates or retrieves the requester wallet at `offset`.
    pub fn wallet_key(&mut self, offset: u32) -> SigningKey {
        if let Some(key) = self.wallet_cache.get(&offset) {
            return key.clone();
        }

        let mut rng = self.rng_for(WALLET_SALT, offset as u64);
        let key = SigningKey::generate(&mut rng);

        self.wallet_cache.insert(offset, key.clone());
        key
    }

    /// Generates the first `count` requester wallets.
    pub fn wallets(&mut self, count: u32) -> Vec<SigningKey> {
        (0..count).map(|offset| self.wallet_key(offset)).collect()
    }

    /// The secrets decryption key of the node at `slot`.
    pub fn node_secret(&self, slot: NodeSlot) -> StaticSecret {
        StaticSecret::random_from_rng(self.rng_for(NODE_SALT, slot.0 as u64))
    }

    /// The DON-wide secrets decryption key.
    pub fn don_secret(&self) -> StaticSecret {
        StaticSecret::random_from_rng(self.rng_for(DON_SALT, 0))
    }

    /// The on-chain transmitter key of the node at `slot`.
    pub fn transmitter_key(&self, slot: NodeSlot) -> SigningKey {
        SigningKey::generate(&mut self.rng_for(TRANSMITTER_SALT, slot.0 as u64))
    }

    pub fn transmitter_address(&self, slot: NodeSlot) -> Address {
        address_of(&self.transmitter_key(slot).verifying_key())
    }

    /// Address for the `index`-th deployed consumer contract.
    pub fn consumer_address(&self, index: u64) -> Address {
        let mut bytes = [0u8; 20];
        self.rng_for(CONSUMER_SALT, index).fill_bytes(&mut bytes);
        Address::from(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use x25519_dalek::PublicKey;

    #[test]
    fn test_deterministic_wallets() {
        let mut provider1 = DeterministicKeyProvider::new(42);
        let mut provider2 = DeterministicKeyProvider::new(42);

        let key1 = provider1.wallet_key(5);
        let key2 = provider2.wallet_key(5);

        assert_eq!(key1.to_bytes(), key2.to_bytes());
        assert_eq!(provider1.wallets(3)[1].to_bytes(), provider2.wallet_key(1).to_bytes());
    }

    #[test]
    fn test_node_keys_distinct_from_don_key() {
        let provider = DeterministicKeyProvider::new(42);
        let don = PublicKey::from(&provider.don_secret());
        let nodes: Vec<PublicKey> = NodeSlot::range(4)
            .map(|slot| PublicKey::from(&provider.node_secret(slot)))
            .collect();

        for (i, node) in nodes.iter().enumerate() {
            assert_ne!(node.as_bytes(), don.as_bytes());
            for other in &nodes[i + 1..] {
                assert_ne!(node.as_bytes(), other.as_bytes());
            }
        }
    }

    #[test]
    fn test_different_seeds_different_keys() {
        let a = DeterministicKeyProvider::new(1);
        let b = DeterministicKeyProvider::new(2);

        assert_ne!(
            PublicKey::from(&a.node_secret(NodeSlot(0))).as_bytes(),
            PublicKey::from(&b.node_secret(NodeSlot(0))).as_bytes()
        );
        assert_ne!(a.transmitter_address(NodeSlot(0)), b.transmitter_address(NodeSlot(0)));
    }

    #[test]
    fn test_addresses_are_stable() {
        let provider = DeterministicKeyProvider::new(9);
        assert_eq!(provider.consumer_address(0), provider.consumer_address(0));
        assert_ne!(provider.consumer_address(0), provider.consumer_address(1));
        assert_ne!(provider.consumer_address(0), Address::ZERO);
    }

    proptest! {
        #[test]
        fn prop_node_key_depends_only_on_seed_and_slot(seed in any::<u64>(), slot in 0u16..64) {
            let a = DeterministicKeyProvider::new(seed);
            let b = DeterministicKeyProvider::new(seed);
            prop_assert_eq!(
                PublicKey::from(&a.node_secret(NodeSlot(slot))).to_bytes(),
                PublicKey::from(&b.node_secret(NodeSlot(slot))).to_bytes()
            );
        }
    }
}
