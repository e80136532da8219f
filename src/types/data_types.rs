/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes, and do not have any major "active" behavior.

use std::fmt::{self, Debug, Display, Formatter};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;

/// Number that identifies a consensus slot.
///
/// Every slot decides at most one value. Slot indices increase by 1 for every subsequent consensus
/// round, and all replicas that participate in the same federation agree on the numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct SlotIndex(u64);

impl SlotIndex {
    /// Create a new `SlotIndex` with an `int` value.
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// Get the `u64` value of this `SlotIndex`.
    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for SlotIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Opaque byte string produced by the external nomination stage.
///
/// The ballot protocol never inspects the contents of a `Value`: validity is checked only through
/// [`ScpDriver::validate_value`](crate::driver::ScpDriver::validate_value), and ordering between
/// values (needed to totally order ballots) is plain lexicographic ordering of the bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct Value(Vec<u8>);

impl Value {
    /// Create a new `Value` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the inner `Vec<u8>` of this `Value`.
    pub const fn bytes(&self) -> &Vec<u8> {
        &self.0
    }

    /// Check whether this `Value` contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&first_seven_base64_chars(&self.0))
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self)
    }
}

/// Identity of a node in the federation: the 32-byte Ed25519 verifying key it signs its envelopes
/// with.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Create a new `NodeId` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `NodeId`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl From<&VerifyingKey> for NodeId {
    fn from(verifying_key: &VerifyingKey) -> Self {
        Self(verifying_key.to_bytes())
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&first_seven_base64_chars(&self.0))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// 32-byte cryptographic hash identifying a [`QuorumSet`](super::quorum_set::QuorumSet).
///
/// Statements do not carry their sender's quorum set inline, only its hash. The body is resolved
/// out-of-band through [`ScpDriver::resolve_quorum_set`](crate::driver::ScpDriver::resolve_quorum_set).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct QuorumSetHash([u8; 32]);

impl QuorumSetHash {
    /// Create a new `QuorumSetHash` wrapping `bytes`.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 32]` value of this `QuorumSetHash`.
    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for QuorumSetHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&first_seven_base64_chars(&self.0))
    }
}

impl Debug for QuorumSetHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "QuorumSetHash({})", self)
    }
}

/// Ed25519 digital signature.
///
/// Within this crate, these are produced using the [`ed25519_dalek`] crate, whose main definitions
/// are re-exported from the [`crypto_primitives`](super::crypto_primitives) module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    /// Create a new `SignatureBytes` wrapping `bytes`.
    pub(crate) fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the inner `[u8; 64]` value of this `SignatureBytes`.
    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first
// 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}
