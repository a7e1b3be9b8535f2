//! Host reference evaluators
//!
//! These define the expected output of each kernel. Arithmetic wraps on
//! overflow, matching the two's-complement behavior of device `int`.

/// `C[i] = A[i] + B[i]` over the common length of `a` and `b`.
pub fn reference_vector_add(a: &[i32], b: &[i32]) -> Vec<i32> {
    a.iter().zip(b).map(|(x, y)| x.wrapping_add(*y)).collect()
}

/// `C = A·B` for row-major `A` (`rows`×`inner`) and `B` (`inner`×`cols`).
///
/// `C[i][j] = Σ_k A[i][k]·B[k][j]`, zero-based, `C` row-major `rows`×`cols`.
///
/// # Panics
///
/// Panics if `a` or `b` is shorter than its shape requires.
pub fn reference_matmul(a: &[i32], b: &[i32], rows: usize, cols: usize, inner: usize) -> Vec<i32> {
    assert!(a.len() >= rows * inner, "A holds {} elements, {rows}x{inner} needed", a.len());
    assert!(b.len() >= inner * cols, "B holds {} elements, {inner}x{cols} needed", b.len());

    let mut c = vec![0i32; rows * cols];
    for i in 0..rows {
        let row = &a[i * inner..(i + 1) * inner];
        for j in 0..cols {
            c[i * cols + j] = row
                .iter()
                .enumerate()
                .fold(0i32, |acc, (k, &x)| acc.wrapping_add(x.wrapping_mul(b[k * cols + j])));
        }
    }
    c
}
