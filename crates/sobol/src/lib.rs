//! Sobol direction matrices for 32-bit low-discrepancy sampling.
//!
//! Produces a table of `NUM_DIMENSIONS * MATRIX_SIZE` words laid out
//! dimension-major: column `c` of dimension `d` lives at `d * MATRIX_SIZE + c`.
//! Only the first 32 columns carry data; the remaining columns are zero so the
//! table keeps the 52-column stride GPU samplers index with.
//!
//! Dimension 0 is the van der Corput sequence. Every further dimension uses the
//! next primitive polynomial over GF(2) (ordered by degree, then value) and a
//! deterministic set of odd initial direction numbers.

/// Number of sampling dimensions in the table.
pub const NUM_DIMENSIONS: usize = 1024;

/// Stride (in words) between consecutive dimensions.
pub const MATRIX_SIZE: usize = 52;

/// Number of meaningful columns per dimension.
pub const NUM_BITS: usize = 32;

/// Largest float strictly below 1.0.
pub const ONE_MINUS_EPSILON: f32 = 0.999_999_94;

/// Build the full direction-matrix table.
pub fn matrices32() -> Vec<u32> {
    let mut table = vec![0u32; NUM_DIMENSIONS * MATRIX_SIZE];

    for col in 0..NUM_BITS {
        table[col] = 1u32 << (31 - col);
    }

    let polys = primitive_polynomials(NUM_DIMENSIONS - 1);
    for (i, &poly) in polys.iter().enumerate() {
        let dim = i + 1;
        let columns = direction_numbers(poly, dim as u64);
        table[dim * MATRIX_SIZE..dim * MATRIX_SIZE + NUM_BITS].copy_from_slice(&columns);
    }

    table
}

/// Sample dimension `dim` of the sequence at `index`, XOR-scrambled.
#[inline]
pub fn sample(matrices: &[u32], dim: usize, index: u32, scramble: u32) -> u32 {
    let base = dim * MATRIX_SIZE;
    let mut v = scramble;
    let mut a = index;
    let mut col = 0;
    while a != 0 {
        if a & 1 != 0 {
            v ^= matrices[base + col];
        }
        a >>= 1;
        col += 1;
    }
    v
}

/// Same as [`sample`] mapped to `[0, 1)`.
#[inline]
pub fn sample_f32(matrices: &[u32], dim: usize, index: u32, scramble: u32) -> f32 {
    let v = sample(matrices, dim, index, scramble);
    (v as f32 * (1.0 / 4_294_967_296.0)).min(ONE_MINUS_EPSILON)
}

/// The first `count` primitive polynomials, lowest degree first.
///
/// Polynomials are encoded with bit `k` holding the coefficient of `x^k`.
pub fn primitive_polynomials(count: usize) -> Vec<u64> {
    let mut out = Vec::with_capacity(count);
    let mut degree = 1u32;
    while out.len() < count {
        let lo = (1u64 << degree) | 1;
        let hi = 1u64 << (degree + 1);
        let mut p = lo;
        while p < hi && out.len() < count {
            if is_primitive(p) {
                out.push(p);
            }
            p += 2;
        }
        degree += 1;
    }
    out
}

/// Whether `poly` is primitive over GF(2).
pub fn is_primitive(poly: u64) -> bool {
    let degree = degree_of(poly);
    if degree == 0 || poly & 1 == 0 {
        return false;
    }
    let order = (1u64 << degree) - 1;
    if pow_x_mod(order, poly) != 1 {
        return false;
    }
    prime_factors(order)
        .into_iter()
        .all(|q| pow_x_mod(order / q, poly) != 1)
}

fn degree_of(poly: u64) -> u32 {
    63 - poly.leading_zeros()
}

fn mul_mod(a: u64, b: u64, poly: u64) -> u64 {
    let degree = degree_of(poly);
    let mut product = 0u64;
    let mut a = a;
    let mut b = b;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        b >>= 1;
        a <<= 1;
        if a & (1u64 << degree) != 0 {
            a ^= poly;
        }
    }
    product
}

/// x^e mod poly
fn pow_x_mod(mut e: u64, poly: u64) -> u64 {
    let mut result = 1u64;
    let mut base = if degree_of(poly) == 1 { 2 ^ poly } else { 2 };
    while e != 0 {
        if e & 1 != 0 {
            result = mul_mod(result, base, poly);
        }
        base = mul_mod(base, base, poly);
        e >>= 1;
    }
    result
}

fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut d = 2u64;
    while d * d <= n {
        if n % d == 0 {
            factors.push(d);
            while n % d == 0 {
                n /= d;
            }
        }
        d += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// 32 direction numbers for one dimension (Bratley–Fox recurrence).
fn direction_numbers(poly: u64, seed: u64) -> [u32; NUM_BITS] {
    let s = degree_of(poly) as usize;
    let mut m = [0u64; NUM_BITS + 1];
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ 0xD1B5_4A32_D192_ED03;

    for k in 1..=s.min(NUM_BITS) {
        if k == 1 {
            m[k] = 1;
            continue;
        }
        state = splitmix64(state);
        m[k] = ((state % (1u64 << (k - 1))) << 1) | 1;
    }

    for k in (s + 1)..=NUM_BITS {
        let mut value = m[k - s] ^ (m[k - s] << s);
        for j in 1..s {
            let a_j = (poly >> (s - j)) & 1;
            if a_j != 0 {
                value ^= m[k - j] << j;
            }
        }
        m[k] = value;
    }

    let mut columns = [0u32; NUM_BITS];
    for k in 1..=NUM_BITS {
        columns[k - 1] = (m[k] << (NUM_BITS - k)) as u32;
    }
    columns
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shape() {
        let m = matrices32();
        assert_eq!(m.len(), NUM_DIMENSIONS * MATRIX_SIZE);
        for dim in [0, 1, 17, NUM_DIMENSIONS - 1] {
            for col in NUM_BITS..MATRIX_SIZE {
                assert_eq!(m[dim * MATRIX_SIZE + col], 0);
            }
        }
    }

    #[test]
    fn test_van_der_corput() {
        let m = matrices32();
        for i in 0..1000u32 {
            assert_eq!(sample(&m, 0, i, 0), i.reverse_bits());
        }
    }

    #[test]
    fn test_second_dimension() {
        let m = matrices32();
        assert_eq!(sample_f32(&m, 1, 0, 0), 0.0);
        assert_eq!(sample_f32(&m, 1, 1, 0), 0.5);
        assert_eq!(sample_f32(&m, 1, 2, 0), 0.75);
        assert_eq!(sample_f32(&m, 1, 3, 0), 0.25);
    }

    #[test]
    fn test_known_primitives() {
        assert!(is_primitive(0b11));
        assert!(is_primitive(0b111));
        assert!(is_primitive(0b1011));
        assert!(is_primitive(0b10011));
        // x^4+x^3+x^2+x+1 has order 5
        assert!(!is_primitive(0b11111));
        // reducible
        assert!(!is_primitive(0b101));
    }

    #[test]
    fn test_enough_polynomials() {
        let polys = primitive_polynomials(NUM_DIMENSIONS - 1);
        assert_eq!(polys.len(), NUM_DIMENSIONS - 1);
        let mut sorted = polys.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), polys.len());
    }

    #[test]
    fn test_every_dimension_is_stratified() {
        let m = matrices32();
        let n = 256u32;
        for dim in [1usize, 2, 5, 64, 511, NUM_DIMENSIONS - 1] {
            let mut seen = vec![false; n as usize];
            for i in 0..n {
                let cell = (sample(&m, dim, i, 0) >> 24) as usize;
                assert!(!seen[cell], "dimension {dim} repeats stratum {cell}");
                seen[cell] = true;
            }
        }
    }

    #[test]
    fn test_scramble_is_xor() {
        let m = matrices32();
        let s = 0xDEAD_BEEF;
        assert_eq!(sample(&m, 3, 0, s), s);
        assert_eq!(sample(&m, 3, 9, s), sample(&m, 3, 9, 0) ^ s);
    }
}
