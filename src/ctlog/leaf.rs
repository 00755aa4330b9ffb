// RFC 6962 Merkle tree leaf codec
//
// Decodes the base64 `leaf_input` of a get-entries response into the
// entry's timestamp, kind and DER certificate bytes.
//
// Layout (MerkleTreeLeaf, v1 timestamped entry):
//   byte 0      version (0)
//   byte 1      leaf type (0 = timestamped_entry)
//   bytes 2-9   timestamp, milliseconds since epoch, big-endian
//   bytes 10-11 entry type (0 = x509_entry, 1 = precert_entry)
//   x509:       3-byte length + DER certificate
//   precert:    32-byte issuer key hash, 3-byte length + TBS certificate

use crate::error::CtError;
use crate::Result;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entry kind within a CT log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeafKind {
    /// Full X.509 certificate
    X509,
    /// Pre-certificate (names are often sanitised)
    Precert,
}

/// A decoded log leaf
#[derive(Debug, Clone)]
pub struct RawLeaf {
    /// Entry index in the log
    pub index: u64,
    /// Leaf timestamp
    pub timestamp: DateTime<Utc>,
    /// Entry kind
    pub kind: LeafKind,
    /// DER bytes of the (pre-)certificate
    pub cert_der: Vec<u8>,
}

/// Decode a base64 `leaf_input` into a [`RawLeaf`]
pub fn decode_leaf(leaf_input: &str, index: u64) -> Result<RawLeaf> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(leaf_input)
        .map_err(|e| CtError::Parse {
            message: format!("failed to decode leaf_input: {}", e),
        })?;

    if bytes.len() < 15 {
        return Err(CtError::Parse {
            message: format!("leaf too short: {} bytes", bytes.len()),
        });
    }

    let version = bytes[0];
    if version != 0 {
        return Err(CtError::Parse {
            message: format!("unsupported leaf version: {}", version),
        });
    }

    let leaf_type = bytes[1];
    if leaf_type != 0 {
        return Err(CtError::Parse {
            message: format!("unsupported leaf type: {}", leaf_type),
        });
    }

    let timestamp_ms = u64::from_be_bytes([
        bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7], bytes[8], bytes[9],
    ]);
    let timestamp = DateTime::<Utc>::from_timestamp(
        (timestamp_ms / 1000) as i64,
        ((timestamp_ms % 1000) * 1_000_000) as u32,
    )
    .unwrap_or_else(Utc::now);

    let entry_type = u16::from_be_bytes([bytes[10], bytes[11]]);
    let (kind, length_offset) = match entry_type {
        0 => (LeafKind::X509, 12),
        // Pre-cert entries carry a 32-byte issuer key hash first.
        1 => (LeafKind::Precert, 12 + 32),
        other => {
            return Err(CtError::Parse {
                message: format!("unknown entry type: {}", other),
            })
        }
    };

    if bytes.len() < length_offset + 3 {
        return Err(CtError::Parse {
            message: "leaf too short for certificate length".to_string(),
        });
    }

    let cert_len = u32::from_be_bytes([
        0,
        bytes[length_offset],
        bytes[length_offset + 1],
        bytes[length_offset + 2],
    ]) as usize;
    let cert_start = length_offset + 3;
    let cert_end = cert_start + cert_len;

    if cert_end > bytes.len() {
        return Err(CtError::Parse {
            message: format!(
                "certificate length {} exceeds leaf size {}",
                cert_len,
                bytes.len()
            ),
        });
    }

    Ok(RawLeaf {
        index,
        timestamp,
        kind,
        cert_der: bytes[cert_start..cert_end].to_vec(),
    })
}

/// Build a leaf_input around arbitrary certificate bytes (test support)
#[cfg(test)]
pub(crate) fn encode_leaf(kind: LeafKind, timestamp_ms: u64, cert: &[u8]) -> String {
    let mut bytes = Vec::new();
    bytes.push(0); // version
    bytes.push(0); // leaf type
    bytes.extend_from_slice(&timestamp_ms.to_be_bytes());
    match kind {
        LeafKind::X509 => bytes.extend_from_slice(&0u16.to_be_bytes()),
        LeafKind::Precert => {
            bytes.extend_from_slice(&1u16.to_be_bytes());
            bytes.extend_from_slice(&[0xab; 32]); // issuer key hash
        }
    }
    let len = cert.len() as u32;
    bytes.extend_from_slice(&len.to_be_bytes()[1..]);
    bytes.extend_from_slice(cert);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
