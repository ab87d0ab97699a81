//! Accounts and the wallet that creates them.
//!
//! Signing is handled elsewhere; a role only needs fresh, address-bearing
//! accounts to take part in channels.

use core::fmt::Debug;

use k256::{
    ecdsa::{SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
};
use rand::{rngs::StdRng, CryptoRng, RngCore};
use sha3::{Digest, Keccak256};

use crate::types::Address;

impl From<&VerifyingKey> for Address {
    fn from(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);

        // Throw away the first byte, which is not part of the public key. It is
        // added by the SEC1 encoding to mark the point as uncompressed.
        let hash: [u8; 32] = Keccak256::digest(&point.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

/// A secp256k1 key pair together with its derived [Address].
pub struct Account {
    key: SigningKey,
    addr: Address,
}

impl Account {
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_key(SigningKey::random(rng))
    }

    pub fn from_key(key: SigningKey) -> Self {
        let addr = Address::from(&key.verifying_key());
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

// Never print the secret key.
impl Debug for Account {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Account").field("addr", &self.addr).finish()
    }
}

/// Source of fresh channel accounts.
pub trait Wallet: Debug + Send + Sync {
    fn new_random_account(&self, rng: &mut StdRng) -> Account;
}

/// Wallet that keeps nothing and hands out throwaway accounts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimWallet;

impl Wallet for SimWallet {
    fn new_random_account(&self, rng: &mut StdRng) -> Account {
        Account::new(rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn known_address() {
        // Private key 1: the public key is the curve's generator point.
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        let key = SigningKey::from_bytes(&bytes).unwrap();
        let acc = Account::from_key(key);

        assert_eq!(
            hex::encode(acc.address().0),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn random_accounts_differ() {
        let mut rng = StdRng::seed_from_u64(0);
        let wallet = SimWallet;
        let a = wallet.new_random_account(&mut rng);
        let b = wallet.new_random_account(&mut rng);
        assert_ne!(a.address(), b.address());
        assert_eq!(Address::from(&a.verifying_key()), a.address());
    }
}
