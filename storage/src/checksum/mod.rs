//! Running CRC32 checksums with splice algebra.
//!
//! [Crc32] folds bytes into a running CRC32 state using the reflected IEEE 802.3
//! polynomial (`0xEDB88320`) with a **zero initial state and no final inversion**.
//! This is the register the on-disk format stores, and it has two properties the
//! format relies on:
//!
//! - The checksum of the empty sequence is `0`.
//! - Leading zero bytes do not disturb the state, so the checksum of a sparse
//!   region equals the checksum of its populated suffix.
//!
//! In this register the map from a byte sequence to its checksum is linear over
//! GF(2), which makes two algebraic operations exact:
//!
//! - [combine]: given `a = crc(A)` and `b = crc(B)`, produce `crc(A || B)`
//!   without touching the underlying bytes.
//! - [erase_prefix]: given `crc(A || B)` and `crc(A)`, recover `crc(B)`.
//!
//! Both ride on [shift], which advances a state across a run of zero bytes in
//! logarithmic time using the standard GF(2) matrix-squaring technique. Together
//! with [Crc32::append], these suffice to maintain a checksum incrementally when
//! a known byte range inside the checksummed region is overwritten: remove the
//! old range's contribution and splice in the new one.
//!
//! The engine is pure: no I/O, no global state.

/// The reflected IEEE 802.3 polynomial.
const POLYNOMIAL: u32 = 0xEDB8_8320;

/// A running CRC32 state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    /// Create a new state (the checksum of the empty sequence).
    pub fn new() -> Self {
        Self { state: 0 }
    }

    /// Resume from a previously computed checksum.
    pub fn from_state(state: u32) -> Self {
        Self { state }
    }

    /// Fold `data` into the state.
    ///
    /// `crc32fast` computes the conditioned variant of the register (all-ones
    /// initial state, inverted output), so the raw register is threaded through
    /// it by complementing on the way in and out.
    pub fn append(&mut self, data: &[u8]) {
        let mut hasher = crc32fast::Hasher::new_with_initial(!self.state);
        hasher.update(data);
        self.state = !hasher.finalize();
    }

    /// Return the current checksum.
    pub fn get(&self) -> u32 {
        self.state
    }
}

/// Convenience function to checksum a byte sequence in one call.
pub fn hash(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.append(data);
    crc.get()
}

/// Advance `state` across `zeros` zero bytes.
///
/// Equivalent to appending `zeros` zero bytes, but runs in `O(log zeros)` by
/// repeatedly squaring the register's one-zero-bit transition matrix.
pub fn shift(state: u32, zeros: u64) -> u32 {
    if state == 0 || zeros == 0 {
        return state;
    }

    // Operator for one zero bit: the polynomial in row 0, then a simple
    // right-shift of the register in the remaining rows.
    let mut odd = [0u32; 32];
    odd[0] = POLYNOMIAL;
    let mut row = 1u32;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }

    // Operator for two zero bits, then four.
    let mut even = matrix_square(&odd);
    odd = matrix_square(&even);

    // Apply operators for each set bit of `zeros`. The first squaring inside
    // the loop yields the operator for one zero byte (eight zero bits).
    let mut state = state;
    let mut zeros = zeros;
    loop {
        even = matrix_square(&odd);
        if zeros & 1 != 0 {
            state = matrix_times(&even, state);
        }
        zeros >>= 1;
        if zeros == 0 {
            break;
        }

        odd = matrix_square(&even);
        if zeros & 1 != 0 {
            state = matrix_times(&odd, state);
        }
        zeros >>= 1;
        if zeros == 0 {
            break;
        }
    }
    state
}

/// Stitch two adjacent checksums: given `left = crc(A)`, `right = crc(B)`, and
/// `right_len = |B|`, return `crc(A || B)`.
pub fn combine(left: u32, right: u32, right_len: u64) -> u32 {
    shift(left, right_len) ^ right
}

/// Remove a known prefix: given `whole = crc(A || B)`, `prefix = crc(A)`, and
/// `suffix_len = |B|`, return `crc(B)`.
pub fn erase_prefix(whole: u32, prefix: u32, suffix_len: u64) -> u32 {
    whole ^ shift(prefix, suffix_len)
}

/// Multiply a GF(2) transition matrix by a register vector.
fn matrix_times(matrix: &[u32; 32], mut vector: u32) -> u32 {
    let mut sum = 0;
    let mut row = 0;
    while vector != 0 {
        if vector & 1 != 0 {
            sum ^= matrix[row];
        }
        vector >>= 1;
        row += 1;
    }
    sum
}

/// Square a GF(2) transition matrix, composing the operator with itself.
fn matrix_square(matrix: &[u32; 32]) -> [u32; 32] {
    let mut square = [0u32; 32];
    for (row, entry) in square.iter_mut().enumerate() {
        *entry = matrix_times(matrix, matrix[row]);
    }
    square
}
