//! Reed-Solomon erasure coding over GF(2^8).
//!
//! Uses a systematic generator matrix derived from a Vandermonde matrix:
//! every square submatrix of a Vandermonde matrix over distinct points is
//! invertible, so any `sblen` received symbols determine the block. This
//! is the optimal codec: the driver may stop feeding symbols the moment
//! `sblen` of them have arrived.

use super::{BlockDecoder, BlockEncoder};
use crate::buffer::Pool;
use bytes::Bytes;
use once_cell::sync::Lazy;
use tracing::error;

/// Primitive polynomial x^8 + x^4 + x^3 + x^2 + 1.
const GF_POLY: u16 = 0x11d;

/// Codewords cannot exceed the field size minus the zero element.
const MAX_SYMBOLS: usize = 255;

struct Tables {
    exp: [u8; 512],
    log: [u8; 256],
}

static GF: Lazy<Tables> = Lazy::new(|| {
    let mut exp = [0u8; 512];
    let mut log = [0u8; 256];

    let mut x: u16 = 1;
    for i in 0..255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF_POLY;
        }
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }

    Tables { exp, log }
});

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        0
    } else {
        GF.exp[GF.log[a as usize] as usize + GF.log[b as usize] as usize]
    }
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0);
    GF.exp[255 - GF.log[a as usize] as usize]
}

#[inline]
fn gf_pow(x: u8, n: usize) -> u8 {
    if n == 0 {
        1
    } else if x == 0 {
        0
    } else {
        GF.exp[(GF.log[x as usize] as usize * n) % 255]
    }
}

/// Multiply-accumulate a scaled row into `acc`: `acc ^= coeff * row`.
fn gf_mul_add(acc: &mut [u8], row: &[u8], coeff: u8) {
    if coeff == 0 {
        return;
    }
    for (a, &r) in acc.iter_mut().zip(row) {
        *a ^= gf_mul(coeff, r);
    }
}

/// Invert a `k`×`k` row-major matrix in place via Gauss-Jordan.
/// Returns false for a singular matrix.
fn gf_invert(matrix: &mut [u8], k: usize) -> bool {
    let mut inverse = vec![0u8; k * k];
    for i in 0..k {
        inverse[i * k + i] = 1;
    }

    for col in 0..k {
        // Find and swap in a nonzero pivot.
        let Some(pivot) = (col..k).find(|&r| matrix[r * k + col] != 0) else {
            return false;
        };
        if pivot != col {
            for j in 0..k {
                matrix.swap(pivot * k + j, col * k + j);
                inverse.swap(pivot * k + j, col * k + j);
            }
        }

        let scale = gf_inv(matrix[col * k + col]);
        for j in 0..k {
            matrix[col * k + j] = gf_mul(matrix[col * k + j], scale);
            inverse[col * k + j] = gf_mul(inverse[col * k + j], scale);
        }

        for row in 0..k {
            if row == col {
                continue;
            }
            let coeff = matrix[row * k + col];
            if coeff == 0 {
                continue;
            }
            for j in 0..k {
                let m = gf_mul(coeff, matrix[col * k + j]);
                matrix[row * k + j] ^= m;
                let i = gf_mul(coeff, inverse[col * k + j]);
                inverse[row * k + j] ^= i;
            }
        }
    }

    matrix.copy_from_slice(&inverse);
    true
}

/// Build the systematic `n`×`k` generator: identity on top, Vandermonde
/// mixing rows below.
fn build_generator(k: usize, n: usize) -> Vec<u8> {
    let mut vand = vec![0u8; n * k];
    for (i, row) in vand.chunks_exact_mut(k).enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            *cell = gf_pow(i as u8, j);
        }
    }

    // Normalise so the top k rows become the identity; submatrix
    // invertibility is preserved under right-multiplication.
    let mut top = vand[..k * k].to_vec();
    if !gf_invert(&mut top, k) {
        unreachable!("vandermonde top block is always invertible");
    }

    let mut gen = vec![0u8; n * k];
    for i in 0..n {
        for j in 0..k {
            let mut acc = 0u8;
            for t in 0..k {
                acc ^= gf_mul(vand[i * k + t], top[t * k + j]);
            }
            gen[i * k + j] = acc;
        }
    }
    gen
}

/// Reed-Solomon block encoder.
pub struct RsEncoder {
    payload_size: usize,
    pool: Pool<u8>,
    sblen: usize,
    rblen: usize,
    generator: Vec<u8>,
    source: Vec<Option<Bytes>>,
    repair: Vec<Option<Bytes>>,
}

impl RsEncoder {
    /// Encoder for symbols of `payload_size` bytes.
    #[must_use]
    pub fn new(payload_size: usize, pool: Pool<u8>) -> Self {
        Self {
            payload_size,
            pool,
            sblen: 0,
            rblen: 0,
            generator: Vec::new(),
            source: Vec::new(),
            repair: Vec::new(),
        }
    }
}

impl BlockEncoder for RsEncoder {
    fn begin(&mut self, sblen: usize, rblen: usize) -> bool {
        if sblen + rblen > MAX_SYMBOLS {
            error!("rs encoder: block too large: {}", sblen + rblen);
            return false;
        }
        if self.sblen != sblen || self.rblen != rblen {
            self.generator = build_generator(sblen, sblen + rblen);
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
        assert!(index < self.sblen, "rs encoder: index out of bounds");
        assert_eq!(symbol.len(), self.payload_size, "rs encoder: bad symbol size");
        assert!(self.source[index].is_none(), "rs encoder: symbol set twice");
        self.source[index] = Some(symbol);
    }

    fn fill(&mut self) {
        for r in 0..self.rblen {
            let Some(mut acc) = self.pool.acquire() else {
                error!("rs encoder: scratch pool exhausted");
                return;
            };

            let row = &self.generator[(self.sblen + r) * self.sblen..][..self.sblen];
            for (j, symbol) in self.source.iter().enumerate() {
                let symbol = symbol
                    .as_ref()
                    .expect("rs encoder: fill() before all source symbols set");
                gf_mul_add(&mut acc[..self.payload_size], symbol, row[j]);
            }

            self.repair[r] = Some(Bytes::copy_from_slice(&acc[..self.payload_size]));
        }
    }

    fn repair(&mut self, index: usize) -> Option<Bytes> {
        assert!(
            index >= self.sblen && index < self.sblen + self.rblen,
            "rs encoder: repair index out of bounds",
        );
        self.repair[index - self.sblen].clone()
    }

    fn end(&mut self) {
        self.source.clear();
        self.repair.clear();
    }
}

/// Reed-Solomon block decoder.
pub struct RsDecoder {
    payload_size: usize,
    pool: Pool<u8>,
    sblen: usize,
    rblen: usize,
    generator: Vec<u8>,
    symbols: Vec<Option<Bytes>>,
    received: Vec<bool>,
    n_received: usize,
    dirty: bool,
}

impl RsDecoder {
    /// Decoder for symbols of `payload_size` bytes.
    #[must_use]
    pub fn new(payload_size: usize, pool: Pool<u8>) -> Self {
        Self {
            payload_size,
            pool,
            sblen: 0,
            rblen: 0,
            generator: Vec::new(),
            symbols: Vec::new(),
            received: Vec::new(),
            n_received: 0,
            dirty: false,
        }
    }

    /// Solve for every missing source symbol from any `sblen` received
    /// symbols. No-op when not enough arrived yet.
    fn decode(&mut self) {
        self.dirty = false;

        if self.n_received < self.sblen {
            return;
        }
        if self.symbols[..self.sblen].iter().all(Option::is_some) {
            return;
        }

        let k = self.sblen;
        let rows: Vec<usize> = (0..k + self.rblen).filter(|&i| self.received[i]).take(k).collect();
        debug_assert_eq!(rows.len(), k);

        let mut matrix = vec![0u8; k * k];
        for (r, &row) in rows.iter().enumerate() {
            matrix[r * k..(r + 1) * k].copy_from_slice(&self.generator[row * k..][..k]);
        }
        if !gf_invert(&mut matrix, k) {
            error!("rs decoder: singular decode matrix");
            return;
        }

        for j in 0..k {
            if self.symbols[j].is_some() {
                continue;
            }

            let Some(mut acc) = self.pool.acquire() else {
                error!("rs decoder: scratch pool exhausted");
                return;
            };
            for (r, &row) in rows.iter().enumerate() {
                let symbol = self.symbols[row]
                    .as_ref()
                    .expect("received symbols are stored");
                gf_mul_add(&mut acc[..self.payload_size], symbol, matrix[j * k + r]);
            }

            self.symbols[j] = Some(Bytes::copy_from_slice(&acc[..self.payload_size]));
        }
    }
}

impl BlockDecoder for RsDecoder {
    fn begin(&mut self, sblen: usize, rblen: usize) -> bool {
        if sblen + rblen > MAX_SYMBOLS {
            error!("rs decoder: block too large: {}", sblen + rblen);
            return false;
        }
        if self.sblen != sblen || self.rblen != rblen {
            self.generator = build_generator(sblen, sblen + rblen);
            self.sblen = sblen;
            self.rblen = rblen;
        }
        self.symbols.clear();
        self.symbols.resize(sblen + rblen, None);
        self.received.clear();
        self.received.resize(sblen + rblen, false);
        self.n_received = 0;
        self.dirty = false;
        true
    }

    fn set(&mut self, index: usize, symbol: Bytes) {
        assert!(index < self.sblen + self.rblen, "rs decoder: index out of bounds");
        assert_eq!(symbol.len(), self.payload_size, "rs decoder: bad symbol size");
        assert!(!self.received[index], "rs decoder: symbol set twice");

        self.received[index] = true;
        self.n_received += 1;
        self.symbols[index] = Some(symbol);
        self.dirty = true;
    }

    fn repair(&mut self, index: usize) -> Option<Bytes> {
        if let Some(symbol) = &self.symbols[index] {
            return Some(symbol.clone());
        }
        if index >= self.sblen {
            // Repair symbols are never reconstructed.
            return None;
        }

        if self.dirty {
            self.decode();
        }
        self.symbols[index].clone()
    }

    fn end(&mut self) {
        self.symbols.clear();
        self.symbols.resize(self.sblen + self.rblen, None);
        self.received.clear();
        self.received.resize(self.sblen + self.rblen, false);
        self.n_received = 0;
        self.dirty = false;
    }

    fn is_optimal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: usize = 64;

    fn pool() -> Pool<u8> {
        Pool::new(PAYLOAD, 64)
    }

    fn symbols(k: usize) -> Vec<Bytes> {
        (0..k)
            .map(|i| {
                let data: Vec<u8> = (0..PAYLOAD).map(|j| (i * 31 + j * 7) as u8).collect();
                Bytes::from(data)
            })
            .collect()
    }

    fn encoded(sblen: usize, rblen: usize) -> (Vec<Bytes>, Vec<Bytes>) {
        let source = symbols(sblen);
        let mut encoder = RsEncoder::new(PAYLOAD, pool());
        assert!(encoder.begin(sblen, rblen));
        for (i, s) in source.iter().enumerate() {
            encoder.set(i, s.clone());
        }
        encoder.fill();
        let repair = (sblen..sblen + rblen)
            .map(|i| encoder.repair(i).unwrap())
            .collect();
        (source, repair)
    }

    #[test]
    fn recovers_any_losses_within_budget() {
        let (source, repair) = encoded(20, 10);

        let mut decoder = RsDecoder::new(PAYLOAD, pool());
        assert!(decoder.begin(20, 10));

        // Drop source symbols 3, 7, 12; feed enough repair to compensate.
        for (i, s) in source.iter().enumerate() {
            if ![3, 7, 12].contains(&i) {
                decoder.set(i, s.clone());
            }
        }
        for (r, s) in repair.iter().enumerate().take(3) {
            decoder.set(20 + r, s.clone());
        }

        for (i, s) in source.iter().enumerate() {
            assert_eq!(decoder.repair(i).unwrap(), *s, "symbol {i}");
        }
    }

    #[test]
    fn any_k_of_n_suffice() {
        let (source, repair) = encoded(6, 4);

        // All ten ways of dropping 4 of the first 8 positions still leave
        // at least 6 of 10; spot-check a spread of loss patterns.
        let losses: [&[usize]; 4] = [&[0, 1, 2, 3], &[0, 2, 4, 6], &[5, 6, 7, 8], &[2, 3, 8, 9]];
        for loss in losses {
            let mut decoder = RsDecoder::new(PAYLOAD, pool());
            assert!(decoder.begin(6, 4));
            for i in 0..10 {
                if loss.contains(&i) {
                    continue;
                }
                let symbol = if i < 6 {
                    source[i].clone()
                } else {
                    repair[i - 6].clone()
                };
                decoder.set(i, symbol);
            }
            for (i, s) in source.iter().enumerate() {
                assert_eq!(decoder.repair(i).unwrap(), *s, "loss {loss:?} symbol {i}");
            }
        }
    }

    #[test]
    fn insufficient_symbols_recover_nothing() {
        let (source, repair) = encoded(20, 10);

        let mut decoder = RsDecoder::new(PAYLOAD, pool());
        assert!(decoder.begin(20, 10));

        // 11 losses beat a 10-repair budget: 19 symbols total.
        for (i, s) in source.iter().enumerate().skip(11) {
            decoder.set(i, s.clone());
        }
        for (r, s) in repair.iter().enumerate() {
            decoder.set(20 + r, s.clone());
        }

        for i in 0..11 {
            assert!(decoder.repair(i).is_none(), "symbol {i} must stay lost");
        }
        for (i, s) in source.iter().enumerate().skip(11) {
            assert_eq!(decoder.repair(i).unwrap(), *s);
        }
    }

    #[test]
    fn end_resets_block_state() {
        let (source, repair) = encoded(4, 2);

        let mut decoder = RsDecoder::new(PAYLOAD, pool());
        assert!(decoder.begin(4, 2));
        decoder.set(0, source[0].clone());
        decoder.end();

        // Same indices are settable again after end().
        decoder.set(0, source[1].clone());
        decoder.set(1, source[2].clone());
        decoder.set(2, source[3].clone());
        decoder.set(4, repair[0].clone());
        assert!(decoder.repair(3).is_some());
    }

    #[test]
    fn oversized_block_is_rejected() {
        let mut decoder = RsDecoder::new(PAYLOAD, pool());
        assert!(!decoder.begin(200, 100));
        let mut encoder = RsEncoder::new(PAYLOAD, pool());
        assert!(!encoder.begin(200, 100));
    }
}
