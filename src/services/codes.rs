//! Handover and delivery secret codes.
//!
//! Codes are drawn uniformly from `A-Z0-9` using the operating system CSPRNG. An order
//! carries [`PENDING_CODE`] in both code columns until real codes are issued, and that
//! placeholder never compares equal to anything.

use rand::rngs::OsRng;
use rand::Rng;

/// Placeholder stored before codes are issued.
pub const PENDING_CODE: &str = "PENDING";

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A freshly drawn handover/delivery pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCodes {
    pub handover: String,
    pub delivery: String,
}

#[derive(Debug, Clone, Copy)]
pub struct CodeGenerator {
    length: usize,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self { length: 8 }
    }
}

impl CodeGenerator {
    pub fn new(length: usize) -> Self {
        Self { length }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn generate(&self) -> String {
        let mut rng = OsRng;
        loop {
            let code: String = (0..self.length)
                .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
                .collect();
            if code != PENDING_CODE {
                return code;
            }
        }
    }

    /// Two independent draws, one per leg.
    pub fn generate_pair(&self) -> IssuedCodes {
        IssuedCodes {
            handover: self.generate(),
            delivery: self.generate(),
        }
    }
}

/// Canonical form of user input: trimmed and uppercased.
pub fn normalize(entered: &str) -> String {
    entered.trim().to_ascii_uppercase()
}

/// Compares an entered code with the stored one.
///
/// Always false while the stored value is the placeholder or empty.
pub fn codes_match(stored: &str, entered: &str) -> bool {
    if stored.is_empty() || stored == PENDING_CODE {
        return false;
    }
    let entered = normalize(entered);
    if entered == PENDING_CODE {
        return false;
    }
    constant_time_eq(stored.as_bytes(), entered.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.iter().zip(b) {
        res |= x ^ y;
    }
    res == 0
}
