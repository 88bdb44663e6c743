// CUDA Matrix Engine — GPU kernels + host orchestration via cudarc
//
// This crate is the GPU-resident core of vole: a dense row-major f32 matrix
// engine sized for a minimal GPT-2-style forward pass. All custom kernels
// are compiled at device creation via NVRTC; matrix multiplication can also
// be routed through cuBLAS.
//
// ARCHITECTURE:
// - CudaDevice wraps cudarc's device handle + a cuBLAS handle + a caching
//   memory pool; kernels compile once in CudaDevice::new
// - CudaMatrix is an owning device-buffer handle (CudaSlice<f32> + dims);
//   creation, host<->device transfer, and release are all explicit calls
//   returning Results
// - Element-wise operators mutate their first operand in place, so
//   composition order matters and inputs are not preserved
// - Kernel launches are asynchronous; downloads synchronize, and
//   CudaDevice::synchronize is the explicit join barrier
//
// USAGE:
//   let dev = CudaDevice::new(0)?;
//   let a = dev.upload(&host_a)?;
//   let b = dev.upload(&host_b)?;
//   let mut c = dev.alloc_matrix(a.rows(), b.rows())?;
//   dev.matmul(MatmulStrategy::Tiled, &a, &b, &mut c)?;
//   let result = dev.download(&c)?;

mod kernels;
pub mod pool;

use std::fmt;
use std::sync::Arc;

use cudarc::cublas::CudaBlas;
use cudarc::driver::{CudaSlice, DevicePtr, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use log::{debug, info, warn};

use pool::{CudaMemPool, PoolStats};
use vole_core::{BinaryOp, Error, Matrix, Result, UnaryOp};

// Launch geometry. The element-wise/gather family runs 256-thread 1-D
// blocks; matmul and transpose use the tile shapes baked into the kernels.
const BLOCK_1D: u32 = 256;
const NAIVE_BLOCK: u32 = 16;
const MM_TILE: u32 = 32;
const TR_TILE: u32 = 64;
const TR_BLOCK_ROWS: u32 = 16;
const REDUCE_BLOCK: u32 = 256;
const REDUCE_MAX_GRID: u32 = 256;

/// Standard 1-D CUDA launch configuration for N elements.
fn launch_cfg(n: usize) -> LaunchConfig {
    let grid = (n as u32).div_ceil(BLOCK_1D);
    LaunchConfig {
        grid_dim: (grid.max(1), 1, 1),
        block_dim: (BLOCK_1D, 1, 1),
        shared_mem_bytes: 0,
    }
}

// CudaDevice — cudarc device + cuBLAS handle + memory pool

/// A CUDA device handle. Compiles and caches the engine's kernels on
/// creation and owns the cuBLAS handle used by the library-backed matmul
/// strategy. Clonable (uses Arc internally).
pub struct CudaDevice {
    dev: Arc<cudarc::driver::CudaDevice>,
    blas: Arc<CudaBlas>,
    pool: Arc<CudaMemPool>,
    ordinal: usize,
}

impl CudaDevice {
    /// Create a new CUDA device for the given GPU ordinal (0, 1, ...).
    /// Compiles all vole CUDA kernels on creation.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::msg(format!("CUDA device creation failed: {e}")))?;

        let blas = CudaBlas::new(dev.clone())
            .map_err(|e| Error::msg(format!("cuBLAS init failed: {e}")))?;

        // Query the device compute capability and target it with NVRTC.
        // sm_XX (native SASS) avoids PTX version mismatches between toolkit
        // and driver versions.
        let major = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(9);
        let arch_str: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        debug!("compiling vole kernels for {arch_str}");
        let opts = CompileOptions {
            arch: Some(arch_str),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(kernels::KERNEL_SOURCE, opts)
            .map_err(|e| Error::msg(format!("NVRTC compilation failed: {e}")))?;
        dev.load_ptx(ptx, kernels::MODULE_NAME, kernels::KERNEL_NAMES)
            .map_err(|e| Error::msg(format!("PTX load failed: {e}")))?;
        info!(
            "cuda:{ordinal} ready ({} kernels loaded)",
            kernels::KERNEL_NAMES.len()
        );

        Ok(CudaDevice {
            dev,
            blas: Arc::new(blas),
            pool: Arc::new(CudaMemPool::new()),
            ordinal,
        })
    }

    /// Get the underlying cudarc device handle.
    pub fn device(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.dev
    }

    /// Get the cuBLAS handle.
    pub fn blas(&self) -> &CudaBlas {
        &self.blas
    }

    /// Block the host until every launch and copy issued so far has
    /// completed. This is the engine's explicit join barrier; downloads
    /// also synchronize, but pipelines that end on the device should call
    /// this rather than rely on a transfer's side effect.
    pub fn synchronize(&self) -> Result<()> {
        self.dev
            .synchronize()
            .map_err(|e| Error::msg(format!("synchronize: {e}")))
    }

    /// Release all cached GPU memory back to the CUDA driver.
    pub fn empty_cache(&self) {
        self.pool.empty_cache();
    }

    /// Return pool statistics (cached bytes, hits, misses, etc.).
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Get a compiled kernel function by name.
    fn get_func(&self, name: &'static str) -> Result<cudarc::driver::CudaFunction> {
        self.dev
            .get_func(kernels::MODULE_NAME, name)
            .ok_or_else(|| Error::LaunchFailure {
                kernel: name,
                detail: "kernel not loaded".into(),
            })
    }

    /// Allocate a zeroed f32 device buffer through the pool. Zero-sized
    /// CUDA allocations are rejected by the driver, so empty matrices keep
    /// a one-element backing; their descriptors still report true dims.
    fn alloc_backing(&self, n: usize) -> Result<CudaSlice<f32>> {
        self.pool
            .alloc_zeros_f32(&self.dev, n.max(1))
            .map_err(|e| Error::AllocationFailure(format!("{n} x f32: {e}")))
    }
}

impl Clone for CudaDevice {
    fn clone(&self) -> Self {
        CudaDevice {
            dev: self.dev.clone(),
            blas: self.blas.clone(),
            pool: self.pool.clone(),
            ordinal: self.ordinal,
        }
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice(cuda:{})", self.ordinal)
    }
}

// Safety: cudarc's device is thread-safe (CUDA runtime is thread-safe)
unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

// CudaMatrix / CudaTokens — device-resident buffer handles

/// A dense row-major f32 matrix resident in device memory.
///
/// The handle owns its buffer. It is created only by explicit
/// [`CudaDevice::upload`] / [`CudaDevice::alloc_matrix`] calls and disposed
/// either by drop (memory returns to the driver) or by
/// [`CudaMatrix::release`] (memory returns to the device's pool).
pub struct CudaMatrix {
    data: CudaSlice<f32>,
    rows: usize,
    cols: usize,
}

impl CudaMatrix {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total element count (`rows * cols`).
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand the buffer back to the device's memory pool for reuse.
    pub fn release(self, device: &CudaDevice) {
        device.pool.reclaim_f32(self.data);
    }
}

impl fmt::Debug for CudaMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaMatrix({}x{})", self.rows, self.cols)
    }
}

/// A token-id sequence resident in device memory, consumed by
/// [`CudaDevice::embedding_gather`].
pub struct CudaTokens {
    data: CudaSlice<i32>,
    len: usize,
}

impl CudaTokens {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hand the buffer back to the device's memory pool for reuse.
    pub fn release(self, device: &CudaDevice) {
        device.pool.reclaim_i32(self.data);
    }
}

// Transfer utility — explicit host<->device allocation / copy

impl CudaDevice {
    /// Copy a host matrix into fresh device memory.
    pub fn upload(&self, m: &Matrix) -> Result<CudaMatrix> {
        let data = if m.is_empty() {
            self.alloc_backing(0)?
        } else {
            self.dev
                .htod_copy(m.as_slice().to_vec())
                .map_err(|e| Error::TransferFailure(format!("htod {}x{}: {e}", m.rows(), m.cols())))?
        };
        Ok(CudaMatrix {
            data,
            rows: m.rows(),
            cols: m.cols(),
        })
    }

    /// Copy a device matrix back to the host. The copy is synchronous, so
    /// every kernel previously launched against the buffer has completed by
    /// the time this returns.
    pub fn download(&self, m: &CudaMatrix) -> Result<Matrix> {
        let mut host = self
            .dev
            .dtoh_sync_copy(&m.data)
            .map_err(|e| Error::TransferFailure(format!("dtoh {}x{}: {e}", m.rows, m.cols)))?;
        host.truncate(m.len());
        Matrix::from_vec(host, m.rows, m.cols)
    }

    /// Allocate a zero-filled device matrix through the memory pool.
    pub fn alloc_matrix(&self, rows: usize, cols: usize) -> Result<CudaMatrix> {
        let data = self.alloc_backing(rows * cols)?;
        Ok(CudaMatrix { data, rows, cols })
    }

    /// Copy a token-id sequence into device memory.
    pub fn upload_tokens(&self, tokens: &[i32]) -> Result<CudaTokens> {
        let data = if tokens.is_empty() {
            self.pool
                .alloc_zeros_i32(&self.dev, 1)
                .map_err(|e| Error::AllocationFailure(format!("1 x i32: {e}")))?
        } else {
            self.dev
                .htod_copy(tokens.to_vec())
                .map_err(|e| Error::TransferFailure(format!("htod {} tokens: {e}", tokens.len())))?
        };
        Ok(CudaTokens {
            data,
            len: tokens.len(),
        })
    }

    /// Overwrite every element of a device matrix with a constant.
    pub fn fill(&self, m: &mut CudaMatrix, value: f32) -> Result<()> {
        let n = m.len();
        if n == 0 {
            return Ok(());
        }
        let func = self.get_func("fill_f32")?;
        unsafe { func.launch(launch_cfg(n), (&mut m.data, value, n as u32)) }.map_err(|e| {
            Error::LaunchFailure {
                kernel: "fill_f32",
                detail: e.to_string(),
            }
        })
    }

    /// Copy a contiguous range of rows into a new device matrix.
    pub fn slice_rows(&self, m: &CudaMatrix, start_row: usize, n_rows: usize) -> Result<CudaMatrix> {
        if start_row + n_rows > m.rows {
            return Err(Error::dims(
                "slice_rows",
                format!("rows {start_row}..{} within {}", start_row + n_rows, m.rows),
                format!("{} rows", m.rows),
            ));
        }
        let mut out = self.alloc_matrix(n_rows, m.cols)?;
        let n = out.len();
        if n == 0 {
            return Ok(out);
        }
        let func = self.get_func("copy_rows_f32")?;
        let offset = (start_row * m.cols) as u32;
        unsafe { func.launch(launch_cfg(n), (&m.data, &mut out.data, offset, n as u32)) }.map_err(
            |e| Error::LaunchFailure {
                kernel: "copy_rows_f32",
                detail: e.to_string(),
            },
        )?;
        Ok(out)
    }
}

// Elementwise engine — generic in-place unary/binary transforms
//
// One launcher per family; the operator enum picks the kernel. This is the
// whole dispatch surface: adding an operator means one kernel and one match
// arm, not a new code path.

impl CudaDevice {
    /// Apply an in-place unary operator to every element of `m`. The scalar
    /// `k` parameterizes the operators that need one (division/addition
    /// constants, the tril block width) and is ignored by the rest.
    pub fn unary(&self, op: UnaryOp, m: &mut CudaMatrix, k: f32) -> Result<()> {
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
        let n = m.len();
        if n == 0 {
            return Ok(());
        }
        let name = match op {
            UnaryOp::DivConst => "unary_div_const_f32",
            UnaryOp::AddConst => "unary_add_const_f32",
            UnaryOp::Isqrt => "unary_isqrt_f32",
            UnaryOp::Exp => "unary_exp_f32",
            UnaryOp::Broadcast => "unary_broadcast_f32",
            UnaryOp::Tril => "unary_tril_f32",
            UnaryOp::Gelu => "unary_gelu_f32",
        };
        let cols = m.cols as u32;
        let func = self.get_func(name)?;
        unsafe { func.launch(launch_cfg(n), (&mut m.data, k, cols, n as u32)) }.map_err(|e| {
            Error::LaunchFailure {
                kernel: name,
                detail: e.to_string(),
            }
        })
    }

    /// Apply an in-place binary operator: `a` is overwritten with
    /// `a op b`. Plain operators require identical shapes; the tile
    /// variants require identical row counts and read only column 0 of `b`.
    pub fn binary(&self, op: BinaryOp, a: &mut CudaMatrix, b: &CudaMatrix) -> Result<()> {
        let shapes_ok = match op {
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::Div => {
                a.rows == b.rows && a.cols == b.cols
            }
            BinaryOp::AddTile | BinaryOp::MulTile => {
                a.rows == b.rows && (a.is_empty() || b.cols >= 1)
            }
        };
        if !shapes_ok {
            return Err(Error::dims(
                "binary",
                format!("operand shapes compatible with {op:?} on {}x{}", a.rows, a.cols),
                format!("{}x{}", b.rows, b.cols),
            ));
        }
        let n = a.len();
        if n == 0 {
            return Ok(());
        }
        match op {
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::Div => {
                let name = match op {
                    BinaryOp::Add => "binary_add_f32",
                    BinaryOp::Mul => "binary_mul_f32",
                    _ => "binary_div_f32",
                };
                let func = self.get_func(name)?;
                unsafe { func.launch(launch_cfg(n), (&mut a.data, &b.data, n as u32)) }.map_err(
                    |e| Error::LaunchFailure {
                        kernel: name,
                        detail: e.to_string(),
                    },
                )
            }
            BinaryOp::AddTile | BinaryOp::MulTile => {
                let name = match op {
                    BinaryOp::AddTile => "binary_add_tile_f32",
                    _ => "binary_mul_tile_f32",
                };
                let func = self.get_func(name)?;
                let (a_cols, b_cols) = (a.cols as u32, b.cols as u32);
                unsafe {
                    func.launch(
                        launch_cfg(n),
                        (&mut a.data, &b.data, a_cols, b_cols, n as u32),
                    )
                }
                .map_err(|e| Error::LaunchFailure {
                    kernel: name,
                    detail: e.to_string(),
                })
            }
        }
    }
}

// Matrix-multiply engine — three interchangeable strategies

/// Which implementation computes C = A·Bᵗ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulStrategy {
    /// One thread per output cell, serial dot product.
    Naive,
    /// 32×32 shared-memory tiles over the inner dimension.
    Tiled,
    /// One fused cuBLAS sgemm call.
    Cublas,
}

impl CudaDevice {
    /// C = A·Bᵗ. `a` is aRows×aCols, `b` is bRows×bCols with
    /// `aCols == bCols` (B is logically the transposed operand); `out` must
    /// be aRows×bRows and is fully overwritten.
    pub fn matmul(
        &self,
        strategy: MatmulStrategy,
        a: &CudaMatrix,
        b: &CudaMatrix,
        out: &mut CudaMatrix,
    ) -> Result<()> {
        if a.cols != b.cols {
            return Err(Error::dims(
                "matmul",
                format!("shared inner dimension {}", a.cols),
                format!("{}", b.cols),
            ));
        }
        if out.rows != a.rows || out.cols != b.rows {
            return Err(Error::dims(
                "matmul",
                format!("{}x{} output", a.rows, b.rows),
                format!("{}x{}", out.rows, out.cols),
            ));
        }
        if out.is_empty() {
            return Ok(());
        }
        if a.cols == 0 {
            // Every dot product is empty; the contract still fully
            // overwrites the output.
            return self.fill(out, 0.0);
        }
        match strategy {
            MatmulStrategy::Naive => self.matmul_naive(a, b, out),
            MatmulStrategy::Tiled => self.matmul_tiled(a, b, out),
            MatmulStrategy::Cublas => self.matmul_cublas(a, b, out),
        }
    }

    fn matmul_naive(&self, a: &CudaMatrix, b: &CudaMatrix, out: &mut CudaMatrix) -> Result<()> {
        let func = self.get_func("matmul_naive_f32")?;
        let cfg = LaunchConfig {
            grid_dim: (
                (b.rows as u32).div_ceil(NAIVE_BLOCK),
                (a.rows as u32).div_ceil(NAIVE_BLOCK),
                1,
            ),
            block_dim: (NAIVE_BLOCK, NAIVE_BLOCK, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            func.launch(
                cfg,
                (
                    &a.data,
                    &b.data,
                    &mut out.data,
                    a.rows as u32,
                    a.cols as u32,
                    b.rows as u32,
                ),
            )
        }
        .map_err(|e| Error::LaunchFailure {
            kernel: "matmul_naive_f32",
            detail: e.to_string(),
        })
    }

    fn matmul_tiled(&self, a: &CudaMatrix, b: &CudaMatrix, out: &mut CudaMatrix) -> Result<()> {
        let func = self.get_func("matmul_tiled_f32")?;
        let cfg = LaunchConfig {
            grid_dim: (
                (b.rows as u32).div_ceil(MM_TILE),
                (a.rows as u32).div_ceil(MM_TILE),
                1,
            ),
            block_dim: (MM_TILE, MM_TILE, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            func.launch(
                cfg,
                (
                    &a.data,
                    &b.data,
                    &mut out.data,
                    a.rows as u32,
                    a.cols as u32,
                    b.rows as u32,
                ),
            )
        }
        .map_err(|e| Error::LaunchFailure {
            kernel: "matmul_tiled_f32",
            detail: e.to_string(),
        })
    }

    // Row-major/column-major duality: a column-major GEMM computing Bᵗ·A
    // yields A·Bᵗ in row-major form directly, so a single sgemm call with
    // no explicit transpose suffices. cuBLAS sees our row-major buffers as
    // their column-major transposes, hence OP_T on B and OP_N on A.
    fn matmul_cublas(&self, a: &CudaMatrix, b: &CudaMatrix, out: &mut CudaMatrix) -> Result<()> {
        use cudarc::cublas::sys::cublasOperation_t;
        let (m, n, k) = (b.rows as i32, a.rows as i32, a.cols as i32);
        unsafe {
            cudarc::cublas::result::sgemm(
                *self.blas.handle(),
                cublasOperation_t::CUBLAS_OP_T,
                cublasOperation_t::CUBLAS_OP_N,
                m,
                n,
                k,
                (&1.0f32) as *const f32,
                *b.data.device_ptr() as *const f32,
                k,
                *a.data.device_ptr() as *const f32,
                k,
                (&0.0f32) as *const f32,
                *out.data.device_ptr() as *mut f32,
                m,
            )
        }
        .map_err(|e| Error::LaunchFailure {
            kernel: "sgemm",
            detail: e.to_string(),
        })
    }
}

// Transpose engine — tiled, coalesced, bank-conflict-avoided

impl CudaDevice {
    /// Transpose a device-resident matrix into a caller-allocated
    /// cols×rows output.
    pub fn transpose(&self, input: &CudaMatrix, out: &mut CudaMatrix) -> Result<()> {
        if out.rows != input.cols || out.cols != input.rows {
            return Err(Error::dims(
                "transpose",
                format!("{}x{} output", input.cols, input.rows),
                format!("{}x{}", out.rows, out.cols),
            ));
        }
        if input.is_empty() {
            return Ok(());
        }
        let func = self.get_func("transpose_tiled_f32")?;
        let cfg = LaunchConfig {
            grid_dim: (
                (input.cols as u32).div_ceil(TR_TILE),
                (input.rows as u32).div_ceil(TR_TILE),
                1,
            ),
            block_dim: (TR_TILE, TR_BLOCK_ROWS, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            func.launch(
                cfg,
                (
                    &input.data,
                    &mut out.data,
                    input.rows as u32,
                    input.cols as u32,
                ),
            )
        }
        .map_err(|e| Error::LaunchFailure {
            kernel: "transpose_tiled_f32",
            detail: e.to_string(),
        })
    }

    /// Transpose a host matrix, performing the host↔device transfers around
    /// the kernel. Convenience entry point for callers without
    /// device-resident data.
    pub fn transpose_host(&self, m: &Matrix) -> Result<Matrix> {
        let input = self.upload(m)?;
        let mut out = self.alloc_matrix(m.cols(), m.rows())?;
        self.transpose(&input, &mut out)?;
        let host = self.download(&out)?;
        input.release(self);
        out.release(self);
        Ok(host)
    }
}

// Reduction engine — row sum and global max

impl CudaDevice {
    /// Row-wise sum. Each row's sum is written to that row's column 0 of
    /// `out`; every other position of `out` is left untouched. Broadcasting
    /// the value across the row is the separate [`UnaryOp::Broadcast`]
    /// step.
    pub fn row_sum(&self, input: &CudaMatrix, out: &mut CudaMatrix) -> Result<()> {
        if input.rows != out.rows || input.cols != out.cols {
            return Err(Error::dims(
                "row_sum",
                format!("{}x{}", input.rows, input.cols),
                format!("{}x{}", out.rows, out.cols),
            ));
        }
        if input.is_empty() {
            return Ok(());
        }
        let func = self.get_func("row_sum_f32")?;
        let cfg = LaunchConfig {
            grid_dim: (input.rows as u32, 1, 1),
            block_dim: (REDUCE_BLOCK, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe {
            func.launch(
                cfg,
                (
                    &input.data,
                    &mut out.data,
                    input.rows as u32,
                    input.cols as u32,
                ),
            )
        }
        .map_err(|e| Error::LaunchFailure {
            kernel: "row_sum_f32",
            detail: e.to_string(),
        })
    }

    /// Maximum over every element of the matrix.
    ///
    /// Per-block maxima are merged into a single device accumulator through
    /// a compare-and-swap retry loop over the float's bit pattern (there is
    /// no native floating-point atomic max). The accumulator is seeded with
    /// `f32::MIN`, which no finite input can undercut.
    pub fn global_max(&self, m: &CudaMatrix) -> Result<f32> {
        let n = m.len();
        if n == 0 {
            return Err(Error::dims("global_max", "a non-empty matrix", "0 elements"));
        }
        let mut acc = self
            .dev
            .htod_copy(vec![f32::MIN])
            .map_err(|e| Error::TransferFailure(format!("htod max accumulator: {e}")))?;
        let func = self.get_func("global_max_f32")?;
        let grid = (n as u32).div_ceil(REDUCE_BLOCK).min(REDUCE_MAX_GRID);
        let cfg = LaunchConfig {
            grid_dim: (grid.max(1), 1, 1),
            block_dim: (REDUCE_BLOCK, 1, 1),
            shared_mem_bytes: 0,
        };
        unsafe { func.launch(cfg, (&m.data, &mut acc, n as u32)) }.map_err(|e| {
            Error::LaunchFailure {
                kernel: "global_max_f32",
                detail: e.to_string(),
            }
        })?;
        let host = self
            .dev
            .dtoh_sync_copy(&acc)
            .map_err(|e| Error::TransferFailure(format!("dtoh max accumulator: {e}")))?;
        Ok(host[0])
    }
}

// Embedding gather — token + positional lookup-and-sum

impl CudaDevice {
    /// `out[t][d] = wte[tokens[t]][d] + wpe[d][t]`.
    ///
    /// The positional table `wpe` is stored dimension-major with an
    /// explicit row stride `pos_stride` (its column count) — the table's
    /// position capacity, decoupled from the length of this particular
    /// token sequence. One thread per (token, dimension) pair.
    pub fn embedding_gather(
        &self,
        tokens: &CudaTokens,
        wte: &CudaMatrix,
        wpe: &CudaMatrix,
        pos_stride: usize,
        out: &mut CudaMatrix,
    ) -> Result<()> {
        let dim = wte.cols;
        if out.rows != tokens.len || out.cols != dim {
            return Err(Error::dims(
                "embedding_gather",
                format!("{}x{dim} output", tokens.len),
                format!("{}x{}", out.rows, out.cols),
            ));
        }
        if wpe.rows != dim || wpe.cols != pos_stride || tokens.len > pos_stride {
            return Err(Error::dims(
                "embedding_gather",
                format!("{dim}x{pos_stride} positional table covering {} positions", tokens.len),
                format!("{}x{}", wpe.rows, wpe.cols),
            ));
        }
        let n = out.len();
        if n == 0 {
            return Ok(());
        }
        let func = self.get_func("embed_gather_f32")?;
        unsafe {
            func.launch(
                launch_cfg(n),
                (
                    &tokens.data,
                    &wte.data,
                    &wpe.data,
                    &mut out.data,
                    tokens.len as u32,
                    dim as u32,
                    pos_stride as u32,
                ),
            )
        }
        .map_err(|e| Error::LaunchFailure {
            kernel: "embed_gather_f32",
            detail: e.to_string(),
        })
    }
}

// Softmax sampler — reduction + elementwise composition

impl CudaDevice {
    /// Sample a token index from one row of unnormalized logits, drawing
    /// the uniform value from a caller-supplied source.
    ///
    /// The logits buffer is consumed: it holds the normalized probability
    /// vector afterwards.
    pub fn softmax_sample<R: rand::Rng>(
        &self,
        logits: &mut CudaMatrix,
        rng: &mut R,
    ) -> Result<usize> {
        let r = rng.gen::<f32>();
        self.softmax_sample_at(logits, r)
    }

    /// Sample with an explicit pre-drawn uniform value `r ∈ [0, 1)`.
    /// Deterministic for a fixed `r`, which is what the tests rely on.
    ///
    /// The pipeline runs strictly in order — global max, subtract,
    /// exponentiate, row sum, normalize — each kernel consuming the fully
    /// written output of the previous one. The final inverse-CDF scan is
    /// sequential over the distribution by nature, so it runs
    /// single-threaded on the host over the downloaded probability row (the
    /// download is also the pipeline's join barrier). At vocabulary widths
    /// this engine targets, the scan is not worth parallelizing.
    pub fn softmax_sample_at(&self, logits: &mut CudaMatrix, r: f32) -> Result<usize> {
        if logits.rows != 1 || logits.cols == 0 {
            return Err(Error::dims(
                "softmax_sample",
                "a 1xN logits row with N >= 1",
                format!("{}x{}", logits.rows, logits.cols),
            ));
        }

        let max = self.global_max(logits)?;
        if !max.is_finite() {
            warn!("softmax_sample: logits maximum is {max}");
            return Err(Error::NumericInstability(format!(
                "logits maximum is {max}"
            )));
        }
        self.unary(UnaryOp::AddConst, logits, -max)?;
        self.unary(UnaryOp::Exp, logits, 0.0)?;

        let mut sums = self.alloc_matrix(1, logits.cols)?;
        self.row_sum(logits, &mut sums)?;
        let total = self.download(&sums)?.at(0, 0);
        sums.release(self);
        if !total.is_finite() || total <= 0.0 {
            warn!("softmax_sample: normalizer degenerated to {total}");
            return Err(Error::NumericInstability(format!(
                "softmax normalizer is {total}"
            )));
        }
        self.unary(UnaryOp::DivConst, logits, total)?;

        let probs = self.download(logits)?;
        let mut cumulative = 0.0f32;
        for (i, &p) in probs.as_slice().iter().enumerate() {
            cumulative += p;
            if cumulative >= r {
                return Ok(i);
            }
        }
        // Rounding can leave the cumulative sum a hair short of r.
        Ok(logits.cols - 1)
    }
}
