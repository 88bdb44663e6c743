//! Scalar CPU reference implementation of every engine operation.
//!
//! Each function mirrors the signature and semantics of its GPU counterpart
//! and exists so the CUDA test suite can validate kernel output against an
//! independent implementation (absolute tolerance 1e-2). Nothing here is a
//! runtime control path: the engine never falls back to these.

use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::ops::{BinaryOp, UnaryOp};

/// C = A·Bᵗ. `a` is aRows×aCols, `b` is bRows×bCols with `aCols == bCols`;
/// the result is aRows×bRows.
pub fn matmul(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.cols() != b.cols() {
        return Err(Error::dims(
            "reference::matmul",
            format!("shared inner dimension {}", a.cols()),
            format!("{}", b.cols()),
        ));
    }
    let (a_rows, a_cols, b_rows) = (a.rows(), a.cols(), b.rows());
    let mut out = Matrix::zeros(a_rows, b_rows);
    let av = a.as_slice();
    let bv = b.as_slice();
    let ov = out.as_mut_slice();
    for i in 0..a_rows {
        for j in 0..b_rows {
            let mut acc = 0.0f32;
            for k in 0..a_cols {
                acc += av[i * a_cols + k] * bv[j * a_cols + k];
            }
            ov[i * b_rows + j] = acc;
        }
    }
    Ok(out)
}

/// Plain transpose: rows×cols in, cols×rows out.
pub fn transpose(m: &Matrix) -> Matrix {
    let (rows, cols) = (m.rows(), m.cols());
    let mut out = Matrix::zeros(cols, rows);
    let src = m.as_slice();
    let dst = out.as_mut_slice();
    for r in 0..rows {
        for c in 0..cols {
            dst[c * rows + r] = src[r * cols + c];
        }
    }
    out
}

/// Row-wise sum. Writes each row's sum to that row's column 0 of `out`;
/// every other position of `out` is left untouched. Broadcasting the value
/// across the row is the separate [`UnaryOp::Broadcast`] step.
pub fn row_sum(input: &Matrix, out: &mut Matrix) -> Result<()> {
    if input.rows() != out.rows() || input.cols() != out.cols() {
        return Err(Error::dims(
            "reference::row_sum",
            format!("{}x{}", input.rows(), input.cols()),
            format!("{}x{}", out.rows(), out.cols()),
        ));
    }
    let cols = input.cols();
    if cols == 0 {
        return Ok(());
    }
    for r in 0..input.rows() {
        let sum: f32 = input.row(r).iter().sum();
        out.as_mut_slice()[r * cols] = sum;
    }
    Ok(())
}

/// Maximum over every element of the matrix.
pub fn global_max(m: &Matrix) -> Result<f32> {
    if m.is_empty() {
        return Err(Error::dims("reference::global_max", "a non-empty matrix", "0 elements"));
    }
    Ok(m.as_slice().iter().copied().fold(f32::MIN, f32::max))
}

/// Apply an in-place unary operator, mutating `m`. Matches the GPU
/// dispatcher's semantics exactly, including the linear-index arithmetic of
/// [`UnaryOp::Broadcast`] and [`UnaryOp::Tril`].
pub fn unary(op: UnaryOp, m: &mut Matrix, k: f32) -> Result<()> {
    let cols = m.cols();
    match op {
        UnaryOp::DivConst if k == 0.0 => {
            return Err(Error::NumericInstability(
                "division by zero constant".into(),
            ))
        }
        UnaryOp::Tril if !(k >= 1.0) => {
            return Err(Error::msg(format!("tril: block width must be >= 1, got {k}")))
        }
        _ => {}
    }
    let data = m.as_mut_slice();
    match op {
        UnaryOp::DivConst => {
            for x in data.iter_mut() {
                *x /= k;
            }
        }
        UnaryOp::AddConst => {
            for x in data.iter_mut() {
                *x += k;
            }
        }
        UnaryOp::Isqrt => {
            for x in data.iter_mut() {
                *x = 1.0 / x.sqrt();
            }
        }
        UnaryOp::Exp => {
            for x in data.iter_mut() {
                *x = x.exp();
            }
        }
        UnaryOp::Broadcast => {
            for i in 0..data.len() {
                data[i] = data[(i / cols) * cols];
            }
        }
        UnaryOp::Tril => {
            let width = k as usize;
            for (i, x) in data.iter_mut().enumerate() {
                *x = if i / width < i % width {
                    0.0
                } else {
                    (*x / 8.0).exp()
                };
            }
        }
        UnaryOp::Gelu => {
            for x in data.iter_mut() {
                let v = *x;
                *x = 0.5 * v * (1.0 + (0.797_884_56 * (v + 0.044715 * v * v * v)).tanh());
            }
        }
    }
    Ok(())
}

/// Apply an in-place binary operator; `a` is overwritten with the result.
pub fn binary(op: BinaryOp, a: &mut Matrix, b: &Matrix) -> Result<()> {
    check_binary_shapes("reference::binary", op, a, b)?;
    let (a_cols, b_cols) = (a.cols(), b.cols());
    let av = a.as_mut_slice();
    let bv = b.as_slice();
    match op {
        BinaryOp::Add => {
            for (x, y) in av.iter_mut().zip(bv) {
                *x += y;
            }
        }
        BinaryOp::Mul => {
            for (x, y) in av.iter_mut().zip(bv) {
                *x *= y;
            }
        }
        BinaryOp::Div => {
            for (x, y) in av.iter_mut().zip(bv) {
                *x /= y;
            }
        }
        BinaryOp::AddTile => {
            for (i, x) in av.iter_mut().enumerate() {
                *x += bv[(i / a_cols) * b_cols];
            }
        }
        BinaryOp::MulTile => {
            for (i, x) in av.iter_mut().enumerate() {
                *x *= bv[(i / a_cols) * b_cols];
            }
        }
    }
    Ok(())
}

/// Shape precondition for binary operators: equal shapes for the plain
/// ops, equal row counts (plus a readable column 0) for tile ops.
fn check_binary_shapes(
    op_name: &'static str,
    op: BinaryOp,
    a: &Matrix,
    b: &Matrix,
) -> Result<()> {
    let ok = match op {
        BinaryOp::Add | BinaryOp::Mul | BinaryOp::Div => {
            a.rows() == b.rows() && a.cols() == b.cols()
        }
        BinaryOp::AddTile | BinaryOp::MulTile => {
            a.rows() == b.rows() && (a.is_empty() || b.cols() >= 1)
        }
    };
    if ok {
        Ok(())
    } else {
        Err(Error::dims(
            op_name,
            format!("operand shapes compatible with {op:?} on {}x{}", a.rows(), a.cols()),
            format!("{}x{}", b.rows(), b.cols()),
        ))
    }
}

/// Token + positional embedding gather:
/// `out[t][d] = wte[tokens[t]][d] + wpe[d][t]`, where `wpe` is stored
/// dimension-major with row stride `pos_stride` (== `wpe.cols()`).
pub fn embedding_gather(
    tokens: &[i32],
    wte: &Matrix,
    wpe: &Matrix,
    pos_stride: usize,
    out: &mut Matrix,
) -> Result<()> {
    check_gather_shapes("reference::embedding_gather", tokens.len(), wte, wpe, pos_stride, out)?;
    let dim = wte.cols();
    let wt = wte.as_slice();
    let wp = wpe.as_slice();
    let ov = out.as_mut_slice();
    for (t, &tok) in tokens.iter().enumerate() {
        for d in 0..dim {
            ov[t * dim + d] = wt[tok as usize * dim + d] + wp[d * pos_stride + t];
        }
    }
    Ok(())
}

/// Shape precondition for the embedding gather.
fn check_gather_shapes(
    op: &'static str,
    n_tokens: usize,
    wte: &Matrix,
    wpe: &Matrix,
    pos_stride: usize,
    out: &Matrix,
) -> Result<()> {
    let dim = wte.cols();
    if out.rows() != n_tokens || out.cols() != dim {
        return Err(Error::dims(
            op,
            format!("{n_tokens}x{dim} output"),
            format!("{}x{}", out.rows(), out.cols()),
        ));
    }
    if wpe.rows() != dim || wpe.cols() != pos_stride || n_tokens > pos_stride {
        return Err(Error::dims(
            op,
            format!("{dim}x{pos_stride} positional table covering {n_tokens} positions"),
            format!("{}x{}", wpe.rows(), wpe.cols()),
        ));
    }
    Ok(())
}

/// Numerically stable softmax over one logits row: subtract the maximum,
/// exponentiate, normalize by the sum.
pub fn softmax_probs(logits: &[f32]) -> Result<Vec<f32>> {
    if logits.is_empty() {
        return Err(Error::dims("reference::softmax_probs", "a non-empty row", "0 elements"));
    }
    let max = logits.iter().copied().fold(f32::MIN, f32::max);
    if !max.is_finite() {
        return Err(Error::NumericInstability(format!(
            "softmax max is {max}"
        )));
    }
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(Error::NumericInstability(format!(
            "softmax normalizer is {total}"
        )));
    }
    Ok(exps.into_iter().map(|e| e / total).collect())
}

/// Sequential inverse-CDF scan: the first index whose cumulative
/// probability reaches `r`, or the last index if rounding leaves the scan
/// short of `r`.
pub fn inverse_cdf_sample(probs: &[f32], r: f32) -> usize {
    let mut cumulative = 0.0f32;
    for (i, &p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative >= r {
            return i;
        }
    }
    probs.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_matmul_hand_case() {
        // A = [[1,2],[3,4]], B = [[5,6],[7,8]] (both 2x2, shared cols=2)
        // C = A·Bᵗ = [[1*5+2*6, 1*7+2*8], [3*5+4*6, 3*7+4*8]]
        let a = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let b = Matrix::from_vec(vec![5.0, 6.0, 7.0, 8.0], 2, 2).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.as_slice(), &[17.0, 23.0, 39.0, 53.0]);
    }

    #[test]
    fn test_matmul_inner_dim_mismatch() {
        let a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(2, 4);
        assert!(matches!(
            matmul(&a, &b),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_matmul_empty_inner_dim() {
        let a = Matrix::zeros(2, 0);
        let b = Matrix::zeros(3, 0);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.rows(), 2);
        assert_eq!(c.cols(), 3);
        assert!(c.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_transpose_round_trip() {
        let m = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        let t = transpose(&m);
        assert_eq!(t.rows(), 3);
        assert_eq!(t.as_slice(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(transpose(&t), m);
    }

    #[test]
    fn test_row_sum_writes_column_zero_only() {
        let input = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        let mut out = Matrix::from_vec(vec![9.0; 6], 2, 3).unwrap();
        row_sum(&input, &mut out).unwrap();
        assert_eq!(out.at(0, 0), 6.0);
        assert_eq!(out.at(1, 0), 15.0);
        // Remaining positions untouched.
        assert_eq!(out.at(0, 1), 9.0);
        assert_eq!(out.at(1, 2), 9.0);
    }

    #[test]
    fn test_row_sum_then_broadcast() {
        let input = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3).unwrap();
        let mut out = Matrix::zeros(2, 3);
        row_sum(&input, &mut out).unwrap();
        unary(UnaryOp::Broadcast, &mut out, 0.0).unwrap();
        assert_eq!(out.row(0), &[6.0, 6.0, 6.0]);
        assert_eq!(out.row(1), &[15.0, 15.0, 15.0]);
    }

    #[test]
    fn test_global_max() {
        let m = Matrix::from_vec(vec![-3.0, 7.5, 0.0, -100.0], 2, 2).unwrap();
        assert_eq!(global_max(&m).unwrap(), 7.5);
        assert!(global_max(&Matrix::zeros(0, 4)).is_err());
    }

    #[test]
    fn test_global_max_all_very_negative() {
        // Values below any ad hoc sentinel like -1e9 must still be found.
        let m = Matrix::from_vec(vec![-3.0e38, -2.0e38], 1, 2).unwrap();
        assert_eq!(global_max(&m).unwrap(), -2.0e38);
    }

    #[test]
    fn test_gelu_at_zero_and_sign() {
        let mut m = Matrix::from_vec(vec![0.0, 1.0, -1.0], 1, 3).unwrap();
        unary(UnaryOp::Gelu, &mut m, 0.0).unwrap();
        assert_eq!(m.at(0, 0), 0.0);
        assert!(approx(m.at(0, 1), 0.8413, 5e-3));
        assert!(approx(m.at(0, 2), -0.1587, 5e-3));
    }

    #[test]
    fn test_tril_block_pattern() {
        // 3x3 with block width 3: strictly-above-diagonal entries zeroed,
        // the rest exp(x/8).
        let mut m = Matrix::from_vec(vec![8.0; 9], 3, 3).unwrap();
        unary(UnaryOp::Tril, &mut m, 3.0).unwrap();
        let e = 1.0f32.exp();
        for r in 0..3 {
            for c in 0..3 {
                if r < c {
                    assert_eq!(m.at(r, c), 0.0, "({r},{c}) should be masked");
                } else {
                    assert!(approx(m.at(r, c), e, 1e-5));
                }
            }
        }
    }

    #[test]
    fn test_div_const_zero_rejected() {
        let mut m = Matrix::zeros(1, 1);
        assert!(matches!(
            unary(UnaryOp::DivConst, &mut m, 0.0),
            Err(Error::NumericInstability(_))
        ));
    }

    #[test]
    fn test_binary_tile_reads_only_column_zero() {
        let mut a1 = Matrix::from_vec(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let mut a2 = a1.clone();
        let b1 = Matrix::from_vec(vec![10.0, -7.0, 20.0, 99.0], 2, 2).unwrap();
        let b2 = Matrix::from_vec(vec![10.0, 55.0, 20.0, -1.0], 2, 2).unwrap();
        binary(BinaryOp::AddTile, &mut a1, &b1).unwrap();
        binary(BinaryOp::AddTile, &mut a2, &b2).unwrap();
        assert_eq!(a1, a2);
        assert_eq!(a1.as_slice(), &[11.0, 12.0, 23.0, 24.0]);
    }

    #[test]
    fn test_binary_shape_mismatch() {
        let mut a = Matrix::zeros(2, 3);
        let b = Matrix::zeros(3, 3);
        assert!(binary(BinaryOp::Add, &mut a, &b).is_err());
        assert!(binary(BinaryOp::AddTile, &mut a, &b).is_err());
    }

    #[test]
    fn test_embedding_gather() {
        // vocab=3, dim=2, pos_stride=4, two tokens [2, 0]
        let wte = Matrix::from_vec(vec![0.0, 0.1, 1.0, 1.1, 2.0, 2.1], 3, 2).unwrap();
        let wpe = Matrix::from_vec(
            vec![
                10.0, 20.0, 30.0, 40.0, // dimension 0 over positions
                50.0, 60.0, 70.0, 80.0, // dimension 1 over positions
            ],
            2,
            4,
        )
        .unwrap();
        let mut out = Matrix::zeros(2, 2);
        embedding_gather(&[2, 0], &wte, &wpe, 4, &mut out).unwrap();
        assert_eq!(out.row(0), &[2.0 + 10.0, 2.1 + 50.0]);
        assert_eq!(out.row(1), &[0.0 + 20.0, 0.1 + 60.0]);
    }

    #[test]
    fn test_embedding_gather_stride_mismatch() {
        let wte = Matrix::zeros(3, 2);
        let wpe = Matrix::zeros(2, 4);
        let mut out = Matrix::zeros(2, 2);
        assert!(embedding_gather(&[0, 1], &wte, &wpe, 8, &mut out).is_err());
    }

    #[test]
    fn test_softmax_probs_normalized_and_ordered() {
        let probs = softmax_probs(&[1.0, 2.0, 3.0]).unwrap();
        let total: f32 = probs.iter().sum();
        assert!(approx(total, 1.0, 1e-5));
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_probs_large_logits_stable() {
        // Without the max subtraction these would overflow to inf.
        let probs = softmax_probs(&[1000.0, 1000.0]).unwrap();
        assert!(approx(probs[0], 0.5, 1e-5));
    }

    #[test]
    fn test_inverse_cdf_positions() {
        let uniform = vec![0.25; 4];
        assert_eq!(inverse_cdf_sample(&uniform, 0.0), 0);
        assert_eq!(inverse_cdf_sample(&uniform, 0.26), 1);
        assert_eq!(inverse_cdf_sample(&uniform, 0.5), 1);
        assert_eq!(inverse_cdf_sample(&uniform, 0.99), 3);
        // Rounding shortfall falls back to the last index.
        assert_eq!(inverse_cdf_sample(&[0.5, 0.4999], 0.99999), 1);
    }
}
