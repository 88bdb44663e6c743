/// In-place element-wise unary operations, each taking one scalar
/// parameter `k` (ignored by operators that don't need it).
///
/// Both the GPU dispatcher and the CPU reference implementation accept
/// these, so an operation is named once and realized per backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// x → x / k
    DivConst,
    /// x → x + k
    AddConst,
    /// x → 1 / sqrt(x)
    Isqrt,
    /// x → exp(x)
    Exp,
    /// Every entry in a row is replaced by that row's column-0 value.
    Broadcast,
    /// Fused causal-mask + scaled exponentiation over k-wide row blocks:
    /// linear index i is zeroed where `i / k < i % k`, otherwise
    /// x → exp(x / 8). Built for preparing attention score matrices.
    Tril,
    /// Tanh-approximate GELU: x → x/2 · (1 + tanh(0.7978845·(x + 0.044715·x³)))
    Gelu,
}

/// In-place element-wise binary operations. The first operand is
/// overwritten with the result; the second is read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// a → a + b, element by element (equal shapes required).
    Add,
    /// a → a · b, element by element.
    Mul,
    /// a → a / b, element by element.
    Div,
    /// Row-tiled add: each row of `a` gets `b[row][0]` added to every
    /// column. Only column 0 of `b` is read; row counts must match.
    AddTile,
    /// Row-tiled multiply, analogous to [`BinaryOp::AddTile`].
    MulTile,
}
