// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet framing for the sandbox worker pipe pair.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR [`OpEnvelope`]
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{Message, OpEnvelope};

/// Protocol magic constant "SHK!".
pub const MAGIC: [u8; 4] = *b"SHK!";
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes.
pub const HEADER_BYTES: usize = 12;
/// Checksum length in bytes.
pub const CHECKSUM_BYTES: usize = 32;
/// Largest payload a peer will accept.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Framing and payload errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes than the header/length announce.
    #[error("incomplete packet")]
    Incomplete,
    /// Header does not start with [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Peer speaks another protocol version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Announced payload exceeds [`MAX_PAYLOAD`].
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    /// blake3 checksum does not match header||payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Envelope names an unknown operation.
    #[error("unknown op {0}")]
    UnknownOp(String),
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

/// Validate a packet header and return the payload length it announces.
pub fn payload_len(header: &[u8; HEADER_BYTES]) -> Result<usize, WireError> {
    if header[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(len));
    }
    Ok(len)
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header.
    pub header: [u8; HEADER_BYTES],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header||payload.
    pub checksum: [u8; CHECKSUM_BYTES],
}

impl Packet {
    /// Build a packet around a CBOR payload.
    pub fn from_payload(payload: Vec<u8>) -> Result<Self, WireError> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len as usize <= MAX_PAYLOAD)
            .ok_or(WireError::PayloadTooLarge(payload.len()))?;
        let mut header = [0u8; HEADER_BYTES];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        header[8..12].copy_from_slice(&len.to_be_bytes());
        let checksum = checksum(&header, &payload);
        Ok(Self {
            header,
            payload,
            checksum,
        })
    }

    /// Concatenate header, payload and checksum.
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_BYTES + self.payload.len() + CHECKSUM_BYTES);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }

    /// Encode an envelope into packet bytes.
    pub fn encode_envelope<P: Serialize>(env: &OpEnvelope<P>) -> Result<Vec<u8>, WireError> {
        Ok(Self::from_payload(to_cbor(env)?)?.into_bytes())
    }

    /// Decode a packet, returning the envelope and the number of bytes consumed.
    pub fn decode_envelope<P: DeserializeOwned>(
        bytes: &[u8],
    ) -> Result<(OpEnvelope<P>, usize), WireError> {
        if bytes.len() < HEADER_BYTES + CHECKSUM_BYTES {
            return Err(WireError::Incomplete);
        }
        let mut header = [0u8; HEADER_BYTES];
        header.copy_from_slice(&bytes[..HEADER_BYTES]);
        let len = payload_len(&header)?;
        let total = HEADER_BYTES + len + CHECKSUM_BYTES;
        if bytes.len() < total {
            return Err(WireError::Incomplete);
        }
        let payload = &bytes[HEADER_BYTES..HEADER_BYTES + len];
        if checksum(&header, payload)[..] != bytes[HEADER_BYTES + len..total] {
            return Err(WireError::ChecksumMismatch);
        }
        Ok((from_cbor(payload)?, total))
    }
}

fn checksum(header: &[u8; HEADER_BYTES], payload: &[u8]) -> [u8; CHECKSUM_BYTES] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// Encode a [`Message`] into packet bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    let (op, payload) = match msg {
        Message::BuildRequest(query) => ("build_request", to_value(query)?),
        Message::BuildReply(resp) => ("build_reply", to_value(resp)?),
    };
    Packet::encode_envelope(&OpEnvelope {
        op: op.to_string(),
        payload,
    })
}

/// Decode packet bytes into `(Message, bytes_consumed)`.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), WireError> {
    let (env, used) = Packet::decode_envelope::<Value>(bytes)?;
    let msg = match env.op.as_str() {
        "build_request" => Message::BuildRequest(from_value(env.payload)?),
        "build_reply" => Message::BuildReply(from_value(env.payload)?),
        other => return Err(WireError::UnknownOp(other.to_string())),
    };
    Ok((msg, used))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, WireError> {
    Value::serialized(value).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, WireError> {
    value
        .deserialized()
        .map_err(|e| WireError::Decode(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{
        Manifest, ModuleRef, SceneMeta, SceneQuery, SceneRef, WorkerReply, WorkerResponse,
    };
    use std::path::PathBuf;

    fn sample_query() -> SceneQuery {
        let mut q = SceneQuery::scene(
            ModuleRef::Package("demo".into()),
            SceneRef::new("demo.shapes", "square"),
        );
        q.extra_args.insert("size".into(), Value::Float(0.5));
        q.overrides.backend = Some("vulkan".into());
        q
    }

    #[test]
    fn request_survives_framing() {
        let query = sample_query();
        let bytes = encode_message(&Message::BuildRequest(query.clone())).unwrap();
        let (msg, used) = decode_message(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(msg, Message::BuildRequest(query));
    }

    #[test]
    fn reply_with_manifest_survives_framing() {
        let mut manifest = Manifest::default();
        manifest.files.insert(PathBuf::from("/work/scene.frag"));
        manifest.modules.insert("demo.shapes".into());
        let resp = WorkerResponse {
            reply: WorkerReply::Scene {
                serialized: "# scene\n".into(),
                meta: SceneMeta {
                    duration: 2.0,
                    aspect_ratio: (16, 9),
                    framerate: (60, 1),
                    clear_color: [0.0, 0.0, 0.0, 1.0],
                    samples: 4,
                    backend: "opengl".into(),
                    system: "linux".into(),
                    media_files: vec![PathBuf::from("/work/a.mp4")],
                    aux_files: vec![],
                },
            },
            manifest,
        };
        let bytes = encode_message(&Message::BuildReply(resp.clone())).unwrap();
        let (msg, _) = decode_message(&bytes).unwrap();
        assert_eq!(msg, Message::BuildReply(resp));
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let mut bytes = encode_message(&Message::BuildRequest(sample_query())).unwrap();
        bytes[HEADER_BYTES + 3] ^= 0xff;
        assert_eq!(decode_message(&bytes).unwrap_err(), WireError::ChecksumMismatch);
    }

    #[test]
    fn truncated_packet_is_incomplete() {
        let bytes = encode_message(&Message::BuildRequest(sample_query())).unwrap();
        assert_eq!(
            decode_message(&bytes[..bytes.len() - 1]).unwrap_err(),
            WireError::Incomplete
        );
    }

    #[test]
    fn header_checks_magic_and_length() {
        let mut header = [0u8; HEADER_BYTES];
        assert_eq!(payload_len(&header).unwrap_err(), WireError::BadMagic);
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&(u32::MAX).to_be_bytes());
        assert!(matches!(
            payload_len(&header),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn unknown_op_is_reported() {
        let bytes = Packet::encode_envelope(&OpEnvelope {
            op: "reboot".to_string(),
            payload: Value::Null,
        })
        .unwrap();
        assert_eq!(
            decode_message(&bytes).unwrap_err(),
            WireError::UnknownOp("reboot".into())
        );
    }
}
