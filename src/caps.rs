//! Capability negotiation primitives
//!
//! Both peers advertise a capability bit vector in their `hello` message.
//! The set of capabilities in effect for a connection is the intersection
//! of ours and the peer's; it decides the id width of the common packet
//! header, the size of several type-specific headers, and whether the
//! optional messages may be sent at all.

use log::{error, warn};

/// Number of 32-bit words in the capability vector.
pub const CAPS_WORDS: usize = 1;

/// A single capability bit.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Cap {
    /// Peer supports bulk streams (USB 3 streams on bulk endpoints).
    BulkStreams = 0,
    /// `device_connect` carries the device version BCD.
    ConnectDeviceVersion = 1,
    /// Peer understands `filter_reject` and `filter_filter`.
    Filter = 2,
    /// Peer acknowledges `device_disconnect` with `device_disconnect_ack`.
    DeviceDisconnectAck = 3,
    /// `ep_info` carries per-endpoint max packet sizes.
    EpInfoMaxPacketSize = 4,
    /// Packet ids are 64 bits wide when both sides support this.
    Ids64Bits = 5,
    /// `bulk_packet` carries a 32-bit length split over two fields.
    BulkLength32Bits = 6,
    /// Peer supports the buffered bulk receiving family.
    BulkReceiving = 7,
}

/// Fixed-width capability bit vector.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Caps(pub [u32; CAPS_WORDS]);

impl Caps {
    pub const fn none() -> Self {
        Caps([0; CAPS_WORDS])
    }

    pub fn set(&mut self, cap: Cap) {
        let bit = cap as usize;
        self.0[bit / 32] |= 1 << (bit % 32);
    }

    pub fn clear(&mut self, cap: Cap) {
        let bit = cap as usize;
        self.0[bit / 32] &= !(1 << (bit % 32));
    }

    pub fn has(&self, cap: Cap) -> bool {
        let bit = cap as usize;
        if bit / 32 >= CAPS_WORDS {
            error!("request for out of bounds cap: {}", bit);
            return false;
        }
        self.0[bit / 32] & (1 << (bit % 32)) != 0
    }

    /// Capabilities active between two peers.
    pub fn intersect(&self, other: &Caps) -> Caps {
        let mut out = Caps::none();
        for (i, word) in out.0.iter_mut().enumerate() {
            *word = self.0[i] & other.0[i];
        }
        out
    }

    /// Raw little-endian bytes, as carried in the `hello` payload.
    pub fn to_bytes(&self) -> [u8; CAPS_WORDS * 4] {
        let mut out = [0; CAPS_WORDS * 4];
        for (i, word) in self.0.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Builds a capability set from a `hello` payload.
    ///
    /// Missing words are taken as zero (an older peer), extra words are
    /// ignored (a newer peer).
    pub fn from_bytes(data: &[u8]) -> Caps {
        let mut caps = Caps::none();
        for (i, word) in caps.0.iter_mut().enumerate() {
            let lo = i * 4;
            if lo + 4 <= data.len() {
                *word = u32::from_le_bytes([data[lo], data[lo + 1], data[lo + 2], data[lo + 3]]);
            }
        }
        caps
    }

    /// Enforces internal constraints on an advertised capability set.
    ///
    /// Bulk streams need the per-endpoint max stream counts carried by the
    /// larger `ep_info` header, which in turn exists only with
    /// [`Cap::EpInfoMaxPacketSize`]. An inconsistent set has the offending
    /// bit cleared rather than failing the session.
    pub fn verify(&mut self, whose: &str) {
        if self.has(Cap::BulkStreams) && !self.has(Cap::EpInfoMaxPacketSize) {
            warn!(
                "{} caps contain bulk_streams without ep_info_max_packet_size, clearing",
                whose
            );
            self.clear(Cap::BulkStreams);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut caps = Caps::none();
        assert!(!caps.has(Cap::Ids64Bits));
        caps.set(Cap::Ids64Bits);
        caps.set(Cap::Filter);
        assert!(caps.has(Cap::Ids64Bits));
        assert!(caps.has(Cap::Filter));
        assert!(!caps.has(Cap::BulkReceiving));
        caps.clear(Cap::Filter);
        assert!(!caps.has(Cap::Filter));
    }

    #[test]
    fn test_intersect() {
        let mut ours = Caps::none();
        ours.set(Cap::Ids64Bits);
        ours.set(Cap::Filter);
        let mut peer = Caps::none();
        peer.set(Cap::Ids64Bits);
        let both = ours.intersect(&peer);
        assert!(both.has(Cap::Ids64Bits));
        assert!(!both.has(Cap::Filter));
    }

    #[test]
    fn test_bytes_round_trip() {
        let mut caps = Caps::none();
        caps.set(Cap::BulkReceiving);
        caps.set(Cap::ConnectDeviceVersion);
        assert_eq!(Caps::from_bytes(&caps.to_bytes()), caps);
        // A short (older peer) payload yields an empty set
        assert_eq!(Caps::from_bytes(&[]), Caps::none());
    }

    #[test]
    fn test_verify_clears_inconsistent_streams() {
        let mut caps = Caps::none();
        caps.set(Cap::BulkStreams);
        caps.verify("peer");
        assert!(!caps.has(Cap::BulkStreams));

        let mut caps = Caps::none();
        caps.set(Cap::BulkStreams);
        caps.set(Cap::EpInfoMaxPacketSize);
        caps.verify("our");
        assert!(caps.has(Cap::BulkStreams));
    }
}
