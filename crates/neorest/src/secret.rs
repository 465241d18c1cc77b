// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Opaque connection secrets: 32 random bytes, serialized as 64 lowercase
//! hex characters. Generated client-side on construction and used as the
//! connection's stable identity across transport reconnects.

use rand::Rng;

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Generate a fresh 32-byte secret, hex-encoded.
pub fn generate() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    encode(&bytes)
}

fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
    }
    out
}
