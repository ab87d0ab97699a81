//! Fixed-size primitive types shared by channels, wallets and the wire layer.

use core::{fmt::Debug, str::FromStr};

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::{construct_uint, hex::FromHex};

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl core::fmt::Display for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

/// Hex strings (with or without `0x`) in human readable formats, raw bytes
/// otherwise.
macro_rules! impl_hex_serde {
    ($T:ident, $N:literal) => {
        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                if serializer.is_human_readable() {
                    serializer.collect_str(self)
                } else {
                    serializer.serialize_bytes(&self.0)
                }
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(de::Error::custom)
                } else {
                    let bytes = Vec::<u8>::deserialize(deserializer)?;
                    let bytes: [u8; $N] = bytes
                        .try_into()
                        .map_err(|_| de::Error::invalid_length($N, &"fixed-size byte array"))?;
                    Ok($T(bytes))
                }
            }
        }

        impl FromStr for $T {
            type Err = uint::hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                Ok($T(<[u8; $N]>::from_hex(s)?))
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
        impl_hex_serde!($T, $N);
    };
}

bytesN!(Bytes32, 32);
bytesN!(Hash, 32);

// We could use primitive_types::U256 here, but it serializes to a hex string
// and pulls in more than we need. Balances are written as decimal strings in
// human readable formats and as 32 big endian bytes otherwise.
construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            let mut bytes = [0u8; 32];
            self.to_big_endian(&mut bytes);
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            U256::from_dec_str(&s).map_err(|e| de::Error::custom(format!("{e:?}")))
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            if bytes.len() != 32 {
                return Err(de::Error::invalid_length(bytes.len(), &"32 bytes"));
            }
            Ok(U256::from_big_endian(&bytes))
        }
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

/// Participant address: the last 20 bytes of the Keccak-256 hash of an
/// uncompressed secp256k1 public key.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);
impl_hex_debug!(Address);
impl_hex_serde!(Address, 20);

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}
