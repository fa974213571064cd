//! Kestrel Core - Core types, cryptography, and serialization
//!
//! This crate provides the data model shared by every Kestrel crate: blocks,
//! validator sets, HotStuff messages and quorum certificates, together with
//! the ed25519/Blake3 primitives they are signed and hashed with.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{
    hash_blake3, hash_pair, merkle_root, sign, verify, Address, Hash, KeyPair, PublicKey, SecretKey, Sig,
};
pub use error::CoreError;
pub use types::*;
