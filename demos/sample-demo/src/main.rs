// Sample Demo — embedding gather → logits → softmax sampling on the GPU
//
// Builds a toy vocabulary, gathers token + positional embeddings, projects
// back onto the vocabulary (tied weights, the GPT-2 trick), and samples a
// handful of next-token candidates from the final position's logits.
//
// Usage:
//   RUST_LOG=info cargo run --release -p sample-demo
//
// Requires CUDA device 0.

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vole_core::Matrix;
use vole_cuda::{CudaDevice, MatmulStrategy};

const VOCAB: usize = 64;
const DIM: usize = 32;
const MAX_SEQ: usize = 16;

fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Matrix {
    let data = (0..rows * cols).map(|_| rng.gen::<f32>() - 0.5).collect();
    Matrix::from_vec(data, rows, cols).expect("shape matches data")
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut rng = StdRng::seed_from_u64(42);

    let dev = CudaDevice::new(0)?;
    info!("device ready: {dev:?}");

    // Toy embedding tables; the positional table is dimension-major with
    // MAX_SEQ as its stride.
    let wte = dev.upload(&random_matrix(VOCAB, DIM, &mut rng))?;
    let wpe = dev.upload(&random_matrix(DIM, MAX_SEQ, &mut rng))?;

    let token_ids: Vec<i32> = (0..8).map(|_| rng.gen_range(0..VOCAB as i32)).collect();
    info!("context tokens: {token_ids:?}");
    let tokens = dev.upload_tokens(&token_ids)?;

    let mut hidden = dev.alloc_matrix(token_ids.len(), DIM)?;
    dev.embedding_gather(&tokens, &wte, &wpe, MAX_SEQ, &mut hidden)?;

    // Tied-weight projection: logits = hidden · wteᵗ, then keep only the
    // final position's row.
    let mut logits_all = dev.alloc_matrix(token_ids.len(), VOCAB)?;
    dev.matmul(MatmulStrategy::Tiled, &hidden, &wte, &mut logits_all)?;
    dev.synchronize()?;

    for _ in 0..5 {
        // Sampling consumes the logits row, so re-slice for every draw.
        let mut logits = dev.slice_rows(&logits_all, token_ids.len() - 1, 1)?;
        let idx = dev.softmax_sample(&mut logits, &mut rng)?;
        println!("sampled token: {idx}");
        logits.release(&dev);
    }

    logits_all.release(&dev);
    hidden.release(&dev);
    tokens.release(&dev);
    info!("pool stats: {:?}", dev.pool_stats());
    Ok(())
}
