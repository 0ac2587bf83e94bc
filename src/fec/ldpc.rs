//! LDPC-Staircase erasure coding.
//!
//! Parity equations are laid out deterministically from a shared PRNG
//! seed: each source column receives `n1` ones spread over the `rblen`
//! equations, and repair columns form the staircase (`r_i` appears in
//! equation `i`, `r_{i-1}` carries over). Decoding is iterative
//! back-substitution: an equation with a single unknown resolves it,
//! which may unlock further equations. The codec is non-optimal — some
//! loss patterns need more than `sblen` received symbols — so the driver
//! keeps feeding symbols and retrying.

use super::{BlockDecoder, BlockEncoder};
use crate::buffer::{Pool, PoolBuf};
use bytes::Bytes;
use tracing::error;

/// Park-Miller minimal standard generator; deterministic across hosts,
/// which is all the equation layout needs.
struct Minstd(u32);

impl Minstd {
    fn new(seed: u32) -> Self {
        let seed = seed % 0x7fff_ffff;
        Self(if seed == 0 { 1 } else { seed })
    }

    fn next(&mut self, bound: usize) -> usize {
        self.0 = ((u64::from(self.0) * 16_807) % 0x7fff_ffff) as u32;
        (self.0 as usize) % bound
    }
}

/// Column indices participating in each parity equation, staircase
/// included. Equation `i` XORs to zero over its columns.
fn build_equations(sblen: usize, rblen: usize, seed: u32, n1: usize) -> Vec<Vec<usize>> {
    let mut rng = Minstd::new(seed);
    let mut eqs: Vec<Vec<usize>> = vec![Vec::new(); rblen];

    let n1 = n1.clamp(1, rblen);
    for col in 0..sblen {
        let mut remaining = n1;
        while remaining > 0 {
            let row = rng.next(rblen);
            if !eqs[row].contains(&col) {
                eqs[row].push(col);
                remaining -= 1;
            }
        }
    }

    for (i, eq) in eqs.iter_mut().enumerate() {
        // A degenerate empty equation would make its repair symbol
        // depend on nothing; give it one source column.
        if eq.is_empty() && sblen > 0 {
            let col = rng.next(sblen);
            eq.push(col);
        }
        eq.push(sblen + i);
        if i > 0 {
            eq.push(sblen + i - 1);
        }
    }

    eqs
}

/// LDPC-Staircase block encoder.
pub struct LdpcEncoder {
    payload_size: usize,
    seed: u32,
    n1: usize,
    pool: Pool<u8>,
    sblen: usize,
    rblen: usize,
    equations: Vec<Vec<usize>>,
    source: Vec<Option<Bytes>>,
    repair: Vec<Option<Bytes>>,
}

impl LdpcEncoder {
    /// Encoder for symbols of `payload_size` bytes.
    #[must_use]
    pub fn new(payload_size: usize, seed: u32, n1: usize, pool: Pool<u8>) -> Self {
        Self {
            payload_size,
            seed,
            n1,
            pool,
            sblen: 0,
            rblen: 0,
            equations: Vec::new(),
            source: Vec::new(),
            repair: Vec::new(),
        }
    }
}

impl BlockEncoder for LdpcEncoder {
    fn begin(&mut self, sblen: usize, rblen: usize) -> bool {
        if self.sblen != sblen || self.rblen != rblen {
            self.equations = build_equations(sblen, rblen, self.seed, self.n1);
            self.sblen = sblen;
            self.rblen = rblen;
        }
        self.source.clear();
        self.source.resize(sblen, None);
        self.repair.clear();
        self.repair.resize(rblen, None);
        true
    }

    fn set(&mut self, index: usize, symbol: Bytes) {
        assert!(index < self.sblen, "ldpc encoder: index out of bounds");
        assert_eq!(symbol.len(), self.payload_size, "ldpc encoder: bad symbol size");
        assert!(self.source[index].is_none(), "ldpc encoder: symbol set twice");
        self.source[index] = Some(symbol);
    }

    fn fill(&mut self) {
        let mut prev: Option<Bytes> = None;

        for (i, eq) in self.equations.iter().enumerate() {
            let Some(mut acc) = self.pool.acquire() else {
                error!("ldpc encoder: scratch pool exhausted");
                return;
            };

            for &col in eq {
                let symbol = if col < self.sblen {
                    self.source[col]
                        .as_ref()
                        .expect("ldpc encoder: fill() before all source symbols set")
                } else if col == self.sblen + i {
                    continue; // the unknown this equation defines
                } else {
                    prev.as_ref().expect("staircase references previous repair")
                };
                xor_into(&mut acc[..self.payload_size], symbol);
            }

            let repair = Bytes::copy_from_slice(&acc[..self.payload_size]);
            prev = Some(repair.clone());
            self.repair[i] = Some(repair);
        }
    }

    fn repair(&mut self, index: usize) -> Option<Bytes> {
        assert!(
            index >= self.sblen && index < self.sblen + self.rblen,
            "ldpc encoder: repair index out of bounds",
        );
        self.repair[index - self.sblen].clone()
    }

    fn end(&mut self) {
        self.source.clear();
        self.repair.clear();
    }
}

#[inline]
fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, &b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

struct Equation {
    /// Columns whose symbols have not been absorbed into `acc` yet.
    cols: Vec<usize>,
    acc: PoolBuf<u8>,
}

/// LDPC-Staircase block decoder.
pub struct LdpcDecoder {
    payload_size: usize,
    seed: u32,
    n1: usize,
    pool: Pool<u8>,
    sblen: usize,
    rblen: usize,
    layout: Vec<Vec<usize>>,
    equations: Vec<Equation>,
    col_to_eqs: Vec<Vec<usize>>,
    symbols: Vec<Option<Bytes>>,
    received: Vec<bool>,
}

impl LdpcDecoder {
    /// Decoder for symbols of `payload_size` bytes.
    #[must_use]
    pub fn new(payload_size: usize, seed: u32, n1: usize, pool: Pool<u8>) -> Self {
        Self {
            payload_size,
            seed,
            n1,
            pool,
            sblen: 0,
            rblen: 0,
            layout: Vec::new(),
            equations: Vec::new(),
            col_to_eqs: Vec::new(),
            symbols: Vec::new(),
            received: Vec::new(),
        }
    }

    /// Absorb a known symbol into every equation it participates in,
    /// back-substituting any equation that drops to a single unknown.
    fn absorb(&mut self, index: usize, symbol: &Bytes) {
        let mut work: Vec<(usize, Bytes)> = vec![(index, symbol.clone())];

        while let Some((col, value)) = work.pop() {
            for &eq_idx in &self.col_to_eqs[col] {
                let eq = &mut self.equations[eq_idx];
                let Some(at) = eq.cols.iter().position(|&c| c == col) else {
                    continue;
                };
                xor_into(&mut eq.acc[..self.payload_size], &value);
                eq.cols.swap_remove(at);

                if eq.cols.len() == 1 {
                    // One unabsorbed column left: the accumulator is its
                    // value. It may already be known through another
                    // equation and merely pending absorption; leave that
                    // case to the work list.
                    let unknown = eq.cols[0];
                    if self.symbols[unknown].is_none() {
                        let recovered = Bytes::copy_from_slice(&eq.acc[..self.payload_size]);
                        self.symbols[unknown] = Some(recovered.clone());
                        work.push((unknown, recovered));
                    }
                }
            }
        }
    }
}

impl BlockDecoder for LdpcDecoder {
    fn begin(&mut self, sblen: usize, rblen: usize) -> bool {
        if self.sblen != sblen || self.rblen != rblen {
            self.layout = build_equations(sblen, rblen, self.seed, self.n1);
            self.col_to_eqs = vec![Vec::new(); sblen + rblen];
            for (i, eq) in self.layout.iter().enumerate() {
                for &col in eq {
                    self.col_to_eqs[col].push(i);
                }
            }
            self.sblen = sblen;
            self.rblen = rblen;
        }

        self.equations.clear();
        for eq in &self.layout {
            let Some(acc) = self.pool.acquire() else {
                error!("ldpc decoder: scratch pool exhausted");
                self.equations.clear();
                return false;
            };
            self.equations.push(Equation {
                cols: eq.clone(),
                acc,
            });
        }

        self.symbols.clear();
        self.symbols.resize(sblen + rblen, None);
        self.received.clear();
        self.received.resize(sblen + rblen, false);
        true
    }

    fn set(&mut self, index: usize, symbol: Bytes) {
        assert!(index < self.sblen + self.rblen, "ldpc decoder: index out of bounds");
        assert_eq!(symbol.len(), self.payload_size, "ldpc decoder: bad symbol size");
        assert!(!self.received[index], "ldpc decoder: symbol set twice");

        self.received[index] = true;
        if self.symbols[index].is_some() {
            // Already recovered by back-substitution; the wire copy adds
            // nothing.
            return;
        }
        self.symbols[index] = Some(symbol.clone());
        self.absorb(index, &symbol);
    }

    fn repair(&mut self, index: usize) -> Option<Bytes> {
        self.symbols[index].clone()
    }

    fn end(&mut self) {
        self.equations.clear();
        self.symbols.clear();
        self.symbols.resize(self.sblen + self.rblen, None);
        self.received.clear();
        self.received.resize(self.sblen + self.rblen, false);
    }

    fn is_optimal(&self) -> bool {
        false
    }
}
