//! Frame codec: base64-wrapped JPEG <-> [`Frame`].
//!
//! The wire form of an image is the `data` string of a JSON message.
//! Decoding validates the base64 layer and checks the JPEG start/end
//! markers; it never inspects pixels, so it is cheap enough to run on the
//! connection task.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::error::DecodeError;
use crate::frame::Frame;

/// Largest inbound message accepted, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Stateless frame codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Decode a base64 JPEG into a frame.
    pub fn decode(&self, data: &str, timestamp: f64, sequence: u64) -> Result<Frame, DecodeError> {
        let payload = self.decode_image(data)?;
        Ok(Frame::new(payload, timestamp, sequence))
    }

    /// Decode and validate a base64 JPEG without wrapping it in a frame.
    pub fn decode_image(&self, data: &str) -> Result<Bytes, DecodeError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(DecodeError::TooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let raw = STANDARD
            .decode(data.trim())
            .map_err(|e| DecodeError::Base64(e.to_string()))?;
        if raw.len() < JPEG_SOI.len() + JPEG_EOI.len() {
            return Err(DecodeError::Truncated(raw.len()));
        }
        if raw[..2] != JPEG_SOI {
            return Err(DecodeError::UnsupportedEncoding);
        }
        // Trailing padding after EOI is tolerated; a missing EOI means the
        // image was cut off.
        if !raw.windows(2).rev().take(16).any(|w| w == JPEG_EOI) {
            return Err(DecodeError::Truncated(raw.len()));
        }
        Ok(Bytes::from(raw))
    }

    /// Encode a frame's payload for the wire.
    pub fn encode(&self, frame: &Frame) -> String {
        self.encode_image(frame.payload())
    }

    pub fn encode_image(&self, image: &[u8]) -> String {
        STANDARD.encode(image)
    }
}

/// Smallest byte string [`FrameCodec`] accepts as a JPEG, with `body`
/// between the markers. Used by the load-test client and tests.
pub fn synthetic_jpeg(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&JPEG_SOI);
    out.extend_from_slice(body);
    out.extend_from_slice(&JPEG_EOI);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_jpeg() {
        let codec = FrameCodec;
        let wire = codec.encode_image(&synthetic_jpeg(b"pixels"));
        let frame = codec.decode(&wire, 1.25, 9).unwrap();
        assert_eq!(frame.timestamp(), 1.25);
        assert_eq!(frame.sequence(), 9);
        assert_eq!(&frame.payload()[2..8], b"pixels");
        assert_eq!(codec.encode(&frame), wire);
    }

    #[test]
    fn rejects_bad_base64() {
        let err = FrameCodec.decode("not base64!!", 0.0, 0).unwrap_err();
        assert!(matches!(err, DecodeError::Base64(_)));
    }

    #[test]
    fn rejects_non_jpeg() {
        let wire = FrameCodec.encode_image(b"\x89PNG\r\n\x1a\n....");
        let err = FrameCodec.decode(&wire, 0.0, 0).unwrap_err();
        assert_eq!(err, DecodeError::UnsupportedEncoding);
    }

    #[test]
    fn rejects_truncated_jpeg() {
        let mut img = synthetic_jpeg(b"abcdef");
        img.truncate(img.len() - 2);
        let wire = FrameCodec.encode_image(&img);
        assert!(matches!(
            FrameCodec.decode(&wire, 0.0, 0),
            Err(DecodeError::Truncated(_))
        ));

        let wire = FrameCodec.encode_image(&[0xFF]);
        assert_eq!(
            FrameCodec.decode(&wire, 0.0, 0).unwrap_err(),
            DecodeError::Truncated(1)
        );
    }

    #[test]
    fn rejects_oversized() {
        let data = "A".repeat(MAX_MESSAGE_SIZE + 4);
        assert!(matches!(
            FrameCodec.decode_image(&data),
            Err(DecodeError::TooLarge { .. })
        ));
    }
}
