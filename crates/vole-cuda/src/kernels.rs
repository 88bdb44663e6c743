// CUDA Kernel Suite — the engine's device code, NVRTC-compiled at startup
//
// Every kernel lives in the single KERNEL_SOURCE string below. CudaDevice
// compiles it to PTX once at creation, targeting the installed GPU's
// compute capability, and caches the loaded module.
//
// DESIGN DECISIONS:
// - Everything is dense row-major f32; shapes are validated on the host
//   before any launch, so kernels only guard against trailing-thread
//   overrun.
// - Element-wise kernels mutate their first operand in place (the engine's
//   composition discipline) and share one signature per family so the host
//   can dispatch generically.
// - The tiled matmul zero-fills out-of-range tile elements, so partial
//   tiles at non-multiple-of-32 dimensions never corrupt the accumulator.
// - The transpose tile carries one padding column; without it, the
//   column-major read in phase 2 lands 64 threads on the same bank.
// - The global max merges per-block results through a compare-and-swap
//   retry loop over the float's bit pattern; no native floating-point
//   atomic max is assumed to exist.

/// All kernel source code in one compilation unit.
/// Functions are prefixed by operation and suffixed by dtype (_f32).
pub const KERNEL_SOURCE: &str = r#"

//  FILL / COPY

extern "C" __global__ void fill_f32(float* out, float val, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) out[idx] = val;
}

extern "C" __global__ void copy_rows_f32(const float* src, float* dst, unsigned int offset, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx < n) dst[idx] = src[offset + idx];
}

//  UNARY OPS (in place, one scalar parameter)
//
// Uniform signature: (buffer, k, cols, n). Operators that ignore k or cols
// still take them so the host dispatches every UnaryOp through one launcher.

#define UNARY_KERNEL(name, expr) \
extern "C" __global__ void unary_##name##_f32(float* a, float k, unsigned int cols, unsigned int n) { \
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x; \
    if (idx >= n) return; \
    float x = a[idx]; \
    a[idx] = (expr); \
}

UNARY_KERNEL(div_const, x / k)
UNARY_KERNEL(add_const, x + k)
UNARY_KERNEL(isqrt, rsqrtf(x))
UNARY_KERNEL(exp, expf(x))
UNARY_KERNEL(gelu, 0.5f * x * (1.0f + tanhf(0.7978845608f * (x + 0.044715f * x * x * x))))

// Copy each row's column-0 value across the row. The column-0 thread
// rewrites its own value, so the concurrent reads are safe.
UNARY_KERNEL(broadcast, a[(idx / cols) * cols])

// Causal mask + scaled exponentiation over k-wide row blocks: zero above
// the block diagonal, exp(x/8) on and below it.
extern "C" __global__ void unary_tril_f32(float* a, float k, unsigned int cols, unsigned int n) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n) return;
    unsigned int width = (unsigned int)k;
    float x = a[idx];
    a[idx] = (idx / width < idx % width) ? 0.0f : expf(x * 0.125f);
}

//  BINARY OPS (in place on the first operand)

#define BINARY_KERNEL(name, op) \
extern "C" __global__ void binary_##name##_f32(float* a, const float* b, unsigned int n) { \
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x; \
    if (idx < n) a[idx] = a[idx] op b[idx]; \
}

BINARY_KERNEL(add, +)
BINARY_KERNEL(mul, *)
BINARY_KERNEL(div, /)

// Tile variants read only column 0 of b, broadcast per output row.

#define BINARY_TILE_KERNEL(name, op) \
extern "C" __global__ void binary_##name##_tile_f32( \
    float* a, const float* b, unsigned int a_cols, unsigned int b_cols, unsigned int n \
) { \
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x; \
    if (idx < n) a[idx] = a[idx] op b[(idx / a_cols) * b_cols]; \
}

BINARY_TILE_KERNEL(add, +)
BINARY_TILE_KERNEL(mul, *)

//  MATMUL (C = A * B^T, shared inner dimension a_cols == b_cols)

extern "C" __global__ void matmul_naive_f32(
    const float* a, const float* b, float* out,
    unsigned int a_rows, unsigned int a_cols, unsigned int b_rows
) {
    unsigned int row = blockIdx.y * blockDim.y + threadIdx.y;
    unsigned int col = blockIdx.x * blockDim.x + threadIdx.x;
    if (row >= a_rows || col >= b_rows) return;
    float acc = 0.0f;
    for (unsigned int k = 0; k < a_cols; k++) {
        acc += a[row * a_cols + k] * b[col * a_cols + k];
    }
    out[row * b_rows + col] = acc;
}

#define MM_TILE 32

extern "C" __global__ void matmul_tiled_f32(
    const float* a, const float* b, float* out,
    unsigned int a_rows, unsigned int a_cols, unsigned int b_rows
) {
    __shared__ float a_tile[MM_TILE][MM_TILE];
    __shared__ float b_tile[MM_TILE][MM_TILE];

    unsigned int tx = threadIdx.x;
    unsigned int ty = threadIdx.y;
    unsigned int row = blockIdx.y * MM_TILE + ty;
    unsigned int col = blockIdx.x * MM_TILE + tx;

    float acc = 0.0f;
    unsigned int tiles = (a_cols + MM_TILE - 1) / MM_TILE;
    for (unsigned int t = 0; t < tiles; t++) {
        // Load one 32x32 tile of A and of B; zero-fill past the edges so
        // partial tiles contribute nothing to the sum.
        unsigned int k = t * MM_TILE + tx;
        unsigned int b_row = blockIdx.x * MM_TILE + ty;
        a_tile[ty][tx] = (row < a_rows && k < a_cols) ? a[row * a_cols + k] : 0.0f;
        b_tile[ty][tx] = (b_row < b_rows && k < a_cols) ? b[b_row * a_cols + k] : 0.0f;
        __syncthreads();

        for (unsigned int kk = 0; kk < MM_TILE; kk++) {
            acc += a_tile[ty][kk] * b_tile[tx][kk];
        }
        __syncthreads();
    }

    if (row < a_rows && col < b_rows) out[row * b_rows + col] = acc;
}

//  TRANSPOSE (rows x cols -> cols x rows, 64x64 tiles, 64x16 blocks)

#define TR_TILE 64
#define TR_BLOCK_ROWS 16

extern "C" __global__ void transpose_tiled_f32(
    const float* inp, float* out, unsigned int rows, unsigned int cols
) {
    // One padding column keeps the phase-2 column reads off a single bank.
    __shared__ float tile[TR_TILE][TR_TILE + 1];

    // Phase 1: coalesced read of a 64x64 tile; each thread covers 4 rows.
    // Out-of-range elements are skipped, never written.
    unsigned int x = blockIdx.x * TR_TILE + threadIdx.x;
    unsigned int y = blockIdx.y * TR_TILE + threadIdx.y;
    for (unsigned int j = 0; j < TR_TILE; j += TR_BLOCK_ROWS) {
        if (x < cols && y + j < rows) {
            tile[threadIdx.y + j][threadIdx.x] = inp[(y + j) * cols + x];
        }
    }
    __syncthreads();

    // Phase 2: coalesced write with swapped block coordinates.
    x = blockIdx.y * TR_TILE + threadIdx.x;
    y = blockIdx.x * TR_TILE + threadIdx.y;
    for (unsigned int j = 0; j < TR_TILE; j += TR_BLOCK_ROWS) {
        if (x < rows && y + j < cols) {
            out[(y + j) * rows + x] = tile[threadIdx.x][threadIdx.y + j];
        }
    }
}

//  REDUCTIONS

#define REDUCE_BLOCK 256

// One block per row. Threads stride over the row's columns, partial sums
// are staged in shared memory, and thread 0 folds them serially. The sum
// lands in the row's column 0 of `out`; every other position is untouched.
extern "C" __global__ void row_sum_f32(
    const float* inp, float* out, unsigned int rows, unsigned int cols
) {
    __shared__ float partial[REDUCE_BLOCK];
    unsigned int row = blockIdx.x;
    unsigned int tid = threadIdx.x;
    if (row >= rows) return;

    float acc = 0.0f;
    for (unsigned int c = tid; c < cols; c += blockDim.x) {
        acc += inp[row * cols + c];
    }
    partial[tid] = acc;
    __syncthreads();

    if (tid == 0) {
        float sum = 0.0f;
        for (unsigned int t = 0; t < blockDim.x; t++) {
            sum += partial[t];
        }
        out[row * cols] = sum;
    }
}

// Float atomic max via compare-and-swap over the value's bit pattern:
// read the current value, compute the candidate maximum, attempt the
// exchange, retry until no other block raced in between.
__device__ void atomic_max_f32(float* addr, float val) {
    int* bits = (int*)addr;
    int old = *bits;
    while (true) {
        float current = __int_as_float(old);
        float candidate = fmaxf(current, val);
        int assumed = old;
        old = atomicCAS(bits, assumed, __float_as_int(candidate));
        if (old == assumed) break;
    }
}

// Grid-stride local maxima, shared-memory tree reduction halving the
// active stride each round, then one CAS merge per block into `result`.
// The host seeds `result` with the most negative finite f32.
extern "C" __global__ void global_max_f32(
    const float* inp, float* result, unsigned int n
) {
    __shared__ float block_max[REDUCE_BLOCK];
    unsigned int tid = threadIdx.x;
    unsigned int idx = blockIdx.x * blockDim.x + tid;

    float local = -3.402823466e+38f;
    for (unsigned int i = idx; i < n; i += gridDim.x * blockDim.x) {
        local = fmaxf(local, inp[i]);
    }
    block_max[tid] = local;
    __syncthreads();

    for (unsigned int stride = blockDim.x / 2; stride > 0; stride >>= 1) {
        if (tid < stride) {
            block_max[tid] = fmaxf(block_max[tid], block_max[tid + stride]);
        }
        __syncthreads();
    }

    if (tid == 0) atomic_max_f32(result, block_max[0]);
}

//  EMBEDDING GATHER
//
// out[t][d] = wte[tokens[t]][d] + wpe[d][t], with the positional table
// stored dimension-major at row stride `pos_stride`. One thread per
// (token, dimension) pair; fully independent gather-and-add.

extern "C" __global__ void embed_gather_f32(
    const int* tokens, const float* wte, const float* wpe, float* out,
    unsigned int n_tokens, unsigned int dim, unsigned int pos_stride
) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= n_tokens * dim) return;
    unsigned int t = idx / dim;
    unsigned int d = idx % dim;
    out[idx] = wte[(unsigned int)tokens[t] * dim + d] + wpe[d * pos_stride + t];
}

"#;

/// All kernel function names used in load_ptx. Must match the extern "C"
/// names above.
pub const KERNEL_NAMES: &[&str] = &[
    // fill / copy
    "fill_f32",
    "copy_rows_f32",
    // unary
    "unary_div_const_f32",
    "unary_add_const_f32",
    "unary_isqrt_f32",
    "unary_exp_f32",
    "unary_gelu_f32",
    "unary_broadcast_f32",
    "unary_tril_f32",
    // binary
    "binary_add_f32",
    "binary_mul_f32",
    "binary_div_f32",
    "binary_add_tile_f32",
    "binary_mul_tile_f32",
    // matmul
    "matmul_naive_f32",
    "matmul_tiled_f32",
    // transpose
    "transpose_tiled_f32",
    // reductions
    "row_sum_f32",
    "global_max_f32",
    // embedding
    "embed_gather_f32",
];

/// Module name used in cudarc's PTX loading.
pub const MODULE_NAME: &str = "vole_kernels";
