use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::ops::BitXor;

use ethereum_types::H160;
use rand::{Rng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use super::NUM_BUCKETS;

fn random_h160() -> H160 {
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    H160::from(bytes)
}

fn encode_hex(h: &H160) -> String {
    h.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(s: &str) -> anyhow::Result<H160> {
    if s.len() != 40 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        anyhow::bail!("expected 40 hex characters, got {s:?}");
    }
    let mut bytes = [0u8; 20];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)?;
    }
    Ok(H160::from(bytes))
}

/// Correlates an outbound request with its reply. 160 fresh random bits per
/// request; the reply carries the same ID back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId(pub H160);

impl RpcId {
    pub fn new_random() -> Self {
        Self(random_h160())
    }
}

impl Serialize for RpcId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&encode_hex(&self.0))
    }
}

impl<'de> Deserialize<'de> for RpcId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        decode_hex(&s).map(RpcId).map_err(serde::de::Error::custom)
    }
}

/// A 160-bit node identifier, also used as the key space for stored values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeID(pub H160);

impl NodeID {
    pub fn random() -> Self {
        Self(random_h160())
    }

    pub fn zero() -> Self {
        Self(H160::zero())
    }

    /// Parse a 40-character hex string (either case) into an ID.
    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        decode_hex(s).map(NodeID)
    }

    /// SHA-1 of the input; this is how values map onto the key space.
    pub fn hash_of<S: AsRef<[u8]>>(input: S) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(input.as_ref());
        let digest = hasher.finalize();
        Self(H160::from_slice(&digest))
    }

    /// Lowercase 40-character hex, the wire representation.
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }

    pub fn distance(&self, other: &NodeID) -> Distance {
        Distance(self.0 ^ other.0)
    }

    /// Index of the bucket `other` falls into relative to `self`: the
    /// position of the highest set bit of the XOR distance, counted from the
    /// least-significant bit. Callers never pass two equal IDs.
    pub fn bucket_index(&self, other: &NodeID) -> usize {
        let xor = self.0 ^ other.0;
        debug_assert!(!xor.is_zero(), "bucket index of an ID with itself");
        for (i, byte) in xor.as_bytes().iter().enumerate() {
            if *byte != 0 {
                return (19 - i) * 8 + (7 - byte.leading_zeros() as usize);
            }
        }
        0
    }

    /// An ID whose distance to `self` lands in bucket `index`: identical
    /// above the index bit, flipped at it, random below. Used to aim lookups
    /// at cold buckets.
    pub fn refresh_id_in_bucket(&self, index: usize) -> NodeID {
        debug_assert!(index < NUM_BUCKETS);
        let mut bytes = *self.0.as_fixed_bytes();
        let byte_index = 19 - index / 8;
        let bit_in_byte = index % 8;
        bytes[byte_index] ^= 1 << bit_in_byte;

        let mut rng = rand::rng();
        for byte in bytes.iter_mut().skip(byte_index + 1) {
            *byte = rng.random();
        }
        if bit_in_byte > 0 {
            let below = (1u8 << bit_in_byte) - 1;
            let scew: u8 = rng.random();
            bytes[byte_index] = (bytes[byte_index] & !below) | (scew & below);
        }
        NodeID(H160::from(bytes))
    }

    /// Short, human-friendly hex for logging, like ab12cd34…ef90a1b2
    pub fn short_hex(&self) -> String {
        let b = self.0.to_fixed_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}…{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[16], b[17], b[18], b[19]
        )
    }
}

impl BitXor for NodeID {
    type Output = NodeID;

    fn bitxor(self, rhs: Self) -> Self::Output {
        NodeID(self.0 ^ rhs.0)
    }
}

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for NodeID {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeID {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        NodeID::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

pub type Key = NodeID;

/// XOR distance between two IDs, ordered as a 160-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(H160);

impl Distance {
    /// Further away than any real peer can be; the lookup sentinel.
    pub const MAX: Distance = Distance(H160([0xff; 20]));
}

/// A peer as seen from this node: its identity, where to reach it, and the
/// distance it was last scored at. Identity is the NodeID alone; the address
/// may change, the cache is recomputed per lookup target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeID,
    pub address: SocketAddr,
    #[serde(skip)]
    pub distance: Option<Distance>,
}

impl Contact {
    pub fn new(node_id: NodeID, address: SocketAddr) -> Self {
        Self {
            node_id,
            address,
            distance: None,
        }
    }

    /// Score this contact against `target`, caching and returning the result.
    pub fn score(&mut self, target: &NodeID) -> Distance {
        let d = self.node_id.distance(target);
        self.distance = Some(d);
        d
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_support::id_with_first_byte;

    #[test]
    fn hex_round_trip() {
        let id = NodeID::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 40);
        assert_eq!(hex, hex.to_lowercase());
        assert_eq!(NodeID::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(NodeID::from_hex("abc").is_err());
        assert!(NodeID::from_hex(&"zz".repeat(20)).is_err());
        // either case is accepted on input
        let upper = NodeID::from_hex("00000000000000000000000000000000FFFFFFFF").unwrap();
        let lower = NodeID::from_hex("00000000000000000000000000000000ffffffff").unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn hash_of_is_sha1() {
        // SHA-1("hello") as a known vector
        let key = NodeID::hash_of(b"hello");
        assert_eq!(key.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    }

    #[test]
    fn bucket_index_is_highest_differing_bit() {
        let a = id_with_first_byte(0x00);
        // differ in the very first (most significant) bit
        let b = id_with_first_byte(0x80);
        assert_eq!(a.bucket_index(&b), 159);

        // differ only in the least significant byte
        let mut low = [0u8; 20];
        low[19] = 0x01;
        let c = NodeID(ethereum_types::H160::from(low));
        assert_eq!(a.bucket_index(&c), 0);
        low[19] = 0x05; // highest set bit is bit 2
        let d = NodeID(ethereum_types::H160::from(low));
        assert_eq!(a.bucket_index(&d), 2);
    }

    #[test]
    fn refresh_id_lands_in_its_bucket() {
        let me = NodeID::random();
        for index in [0, 1, 7, 8, 63, 100, 159] {
            let target = me.refresh_id_in_bucket(index);
            assert_eq!(me.bucket_index(&target), index, "bucket {index}");
        }
    }

    #[test]
    fn distance_orders_numerically() {
        let a = id_with_first_byte(0x00);
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        assert!(a.distance(&near) < a.distance(&far));
        assert!(a.distance(&far) < Distance::MAX);
    }

    #[test]
    fn contact_identity_is_the_node_id() {
        let id = NodeID::random();
        let a = Contact::new(id, "127.0.0.1:4000".parse().unwrap());
        let b = Contact::new(id, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(a, b);

        let mut scored = a;
        let target = NodeID::random();
        let d = scored.score(&target);
        assert_eq!(scored.distance, Some(d));
        assert_eq!(d, id.distance(&target));
    }
}
