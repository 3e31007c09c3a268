//! Datagram protection for gossip traffic.
//!
//! The membership layer treats protection as a black box: every outgoing datagram is passed
//! through [`Encrypter::encrypt`] together with the zone of its destination, and every incoming
//! one through [`Encrypter::decrypt`]. A `None` from `decrypt` means "drop it".
//!
//! [`ZoneKeyring`] authenticates packets with a per-zone HMAC-SHA256 key. Frame layout:
//!
//! ```text
//! [zone_len: u8][zone: zone_len bytes][tag: 32 bytes, only if zone_len > 0][payload]
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

const TAG_LEN: usize = 32;

pub trait Encrypter: Send + Sync {
    fn encrypt(&self, payload: &[u8], dest_zone: &str) -> Vec<u8>;
    fn decrypt(&self, packet: &[u8]) -> Option<Vec<u8>>;
}

/// No protection at all, packets go out as-is.
#[derive(Debug, Default, Clone)]
pub struct PlainText;

impl Encrypter for PlainText {
    fn encrypt(&self, payload: &[u8], _dest_zone: &str) -> Vec<u8> {
        payload.to_vec()
    }

    fn decrypt(&self, packet: &[u8]) -> Option<Vec<u8>> {
        Some(packet.to_vec())
    }
}

/// Per-zone HMAC signing.
///
/// Packets for a zone without a key are sent unsigned. Unsigned packets are only accepted
/// while the keyring is empty.
#[derive(Default, Clone)]
pub struct ZoneKeyring {
    keys: HashMap<String, Vec<u8>>,
}

impl ZoneKeyring {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|(zone, key)| (zone, key.into_bytes()))
                .collect(),
        }
    }

    pub fn set_key(&mut self, zone: &str, key: &str) {
        self.keys.insert(zone.to_string(), key.as_bytes().to_vec());
    }

    fn mac(key: &[u8]) -> Option<HmacSha256> {
        HmacSha256::new_from_slice(key).ok()
    }
}

impl Encrypter for ZoneKeyring {
    fn encrypt(&self, payload: &[u8], dest_zone: &str) -> Vec<u8> {
        let signer = (dest_zone.len() <= u8::MAX as usize)
            .then(|| self.keys.get(dest_zone))
            .flatten()
            .and_then(|key| Self::mac(key));

        let Some(mut mac) = signer else {
            let mut packet = Vec::with_capacity(payload.len() + 1);
            packet.push(0);
            packet.extend_from_slice(payload);
            return packet;
        };

        mac.update(dest_zone.as_bytes());
        mac.update(payload);
        let tag = mac.finalize().into_bytes();

        let mut packet = Vec::with_capacity(1 + dest_zone.len() + TAG_LEN + payload.len());
        packet.push(dest_zone.len() as u8);
        packet.extend_from_slice(dest_zone.as_bytes());
        packet.extend_from_slice(&tag);
        packet.extend_from_slice(payload);
        packet
    }

    fn decrypt(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let (&zone_len, rest) = packet.split_first()?;
        let zone_len = zone_len as usize;

        if zone_len == 0 {
            return self.keys.is_empty().then(|| rest.to_vec());
        }

        if rest.len() < zone_len + TAG_LEN {
            return None;
        }
        let (zone, rest) = rest.split_at(zone_len);
        let (tag, payload) = rest.split_at(TAG_LEN);

        let zone = std::str::from_utf8(zone).ok()?;
        let mut mac = Self::mac(self.keys.get(zone)?)?;
        mac.update(zone.as_bytes());
        mac.update(payload);
        mac.verify_slice(tag).ok()?;

        Some(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyring() -> ZoneKeyring {
        let mut keys = ZoneKeyring::default();
        keys.set_key("eu", "eu-secret");
        keys.set_key("us", "us-secret");
        keys
    }

    #[test]
    fn test_plaintext_is_identity() {
        let packet = PlainText.encrypt(b"hello", "eu");
        assert_eq!(PlainText.decrypt(&packet).unwrap(), b"hello");
    }

    #[test]
    fn test_signed_packet_is_accepted() {
        let keys = keyring();
        let packet = keys.encrypt(br#"{"type":"ping"}"#, "eu");

        assert_eq!(keys.decrypt(&packet).unwrap(), br#"{"type":"ping"}"#);
    }

    #[test]
    fn test_tampered_packet_is_dropped() {
        let keys = keyring();
        let mut packet = keys.encrypt(b"payload", "eu");
        let last = packet.len() - 1;
        packet[last] ^= 0xff;

        assert!(keys.decrypt(&packet).is_none());
    }

    #[test]
    fn test_wrong_zone_key_is_dropped() {
        let sender = keyring();
        let packet = sender.encrypt(b"payload", "us");

        let mut receiver = keyring();
        receiver.set_key("us", "another-secret");

        assert!(receiver.decrypt(&packet).is_none());
    }

    #[test]
    fn test_unsigned_packets_only_accepted_without_keys() {
        let empty = ZoneKeyring::default();
        let packet = empty.encrypt(b"payload", "eu");
        assert_eq!(empty.decrypt(&packet).unwrap(), b"payload");

        assert!(keyring().decrypt(&packet).is_none());
    }

    #[test]
    fn test_truncated_packet_is_dropped() {
        let keys = keyring();
        assert!(keys.decrypt(&[]).is_none());
        assert!(keys.decrypt(&[2, b'e', b'u', 1, 2, 3]).is_none());
    }
}
