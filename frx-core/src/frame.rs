//! Frame and source-identity value types.

use std::fmt;
use std::time::Instant;

use bytes::Bytes;

// ── Frame ────────────────────────────────────────────────────────

/// One compressed image travelling through the relay.
///
/// Immutable once constructed. `timestamp` is whatever the client sent and
/// is echoed back untouched; `received_at` is the server-side arrival
/// instant used for staleness and latency accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    payload: Bytes,
    timestamp: f64,
    sequence: u64,
    received_at: Instant,
}

impl Frame {
    pub fn new(payload: Bytes, timestamp: f64, sequence: u64) -> Self {
        Self {
            payload,
            timestamp,
            sequence,
            received_at: Instant::now(),
        }
    }

    /// Build the processed counterpart of `self`: new payload, same
    /// timestamp, sequence and arrival instant.
    pub fn with_payload(&self, payload: Bytes) -> Self {
        Self {
            payload,
            timestamp: self.timestamp,
            sequence: self.sequence,
            received_at: self.received_at,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Per-session arrival ordinal.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

// ── SourceIdentity ───────────────────────────────────────────────

/// The identity a session asked to be rendered with.
///
/// `image` is the raw reference image the client sent; `descriptor` is
/// whatever the transformation capability derived from it (for the
/// built-in capabilities, the image itself). The BLAKE3 fingerprint of
/// the image identifies it in logs and lets a re-sent identical image
/// skip preparation.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    image: Bytes,
    descriptor: Bytes,
    fingerprint: blake3::Hash,
}

impl SourceIdentity {
    /// An identity whose descriptor is the image itself.
    pub fn from_image(image: Bytes) -> Self {
        let descriptor = image.clone();
        Self::with_descriptor(image, descriptor)
    }

    /// An identity with a capability-derived descriptor.
    pub fn with_descriptor(image: Bytes, descriptor: Bytes) -> Self {
        let fingerprint = blake3::hash(&image);
        Self {
            image,
            descriptor,
            fingerprint,
        }
    }

    /// Fingerprint of a candidate image, for comparing against
    /// [`fingerprint`](Self::fingerprint) before preparing it.
    pub fn fingerprint_of(image: &[u8]) -> blake3::Hash {
        blake3::hash(image)
    }

    pub fn descriptor(&self) -> &Bytes {
        &self.descriptor
    }

    pub fn fingerprint(&self) -> blake3::Hash {
        self.fingerprint
    }

    /// First 12 hex chars of the fingerprint, for log lines.
    pub fn short_fingerprint(&self) -> String {
        let hex = self.fingerprint.to_hex();
        hex.as_str()[..12].to_string()
    }
}

impl fmt::Debug for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceIdentity")
            .field("fingerprint", &self.short_fingerprint())
            .field("image_len", &self.image.len())
            .field("descriptor_len", &self.descriptor.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processed_frame_keeps_timestamp_and_sequence() {
        let f = Frame::new(Bytes::from_static(b"abc"), 12.5, 3);
        let out = f.with_payload(Bytes::from_static(b"xyz!"));
        assert_eq!(out.timestamp(), 12.5);
        assert_eq!(out.sequence(), 3);
        assert_eq!(out.received_at(), f.received_at());
        assert_eq!(out.payload().len(), 4);
    }

    #[test]
    fn identity_fingerprint_is_content_addressed() {
        let a = SourceIdentity::from_image(Bytes::from_static(b"face-a"));
        let b = SourceIdentity::from_image(Bytes::from_static(b"face-a"));
        let c = SourceIdentity::from_image(Bytes::from_static(b"face-c"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint(), SourceIdentity::fingerprint_of(b"face-a"));
        assert_eq!(a.short_fingerprint().len(), 12);
    }
}
