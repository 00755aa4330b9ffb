// Certificate Transparency log protocol
//
// HTTP client for the CT v1 API plus the RFC 6962 Merkle tree leaf codec.

pub mod client;
pub mod leaf;

pub use client::{CtLogClient, LogEntryResponse, SignedTreeHead};
pub use leaf::{decode_leaf, LeafKind, RawLeaf};
