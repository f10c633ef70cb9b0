// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Identity newtypes.
//!
//! `Address` identifies accounts (owners, delegates, assets, payees) and
//! `RequestId` identifies queued spend requests. Both are fixed-width byte
//! strings that travel as lowercase `0x`-prefixed hex on every external
//! surface (JSON, logs), so serde goes through the string form rather than
//! raw byte arrays.

use crate::error::KernelError;
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

fn encode_hex(bytes: &[u8], out: &mut String) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push_str("0x");
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
}

fn decode_hex(s: &str, out: &mut [u8]) -> Result<(), KernelError> {
    let body = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or(KernelError::InvalidId)?;
    if body.len() != out.len() * 2 {
        return Err(KernelError::InvalidId);
    }
    for (i, chunk) in body.as_bytes().chunks(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16).ok_or(KernelError::InvalidId)?;
        let lo = (chunk[1] as char).to_digit(16).ok_or(KernelError::InvalidId)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Ok(())
}

/// 20-byte account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const fn zero() -> Self {
        Self([0u8; 20])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 20];
        decode_hex(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for Address {
    type Error = KernelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(42);
        encode_hex(&self.0, &mut s);
        f.write_str(&s)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

/// 32-byte spend request identifier.
///
/// Assigned by the ledger at queue time; unique and immutable for the
/// lifetime of the request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for RequestId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        decode_hex(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for RequestId {
    type Error = KernelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> String {
        id.to_string()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::with_capacity(66);
        encode_hex(&self.0, &mut s);
        f.write_str(&s)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}
