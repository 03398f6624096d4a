//! Samples a correlated-looking 2D Gaussian with four adaptive chains and
//! prints summary statistics.
//!
//! Run with `RUST_LOG=debug` to watch the prerun adapt and converge.

use multichain::density::DiagonalGaussian;
use multichain::sampler::{Config, Sampler};
use multichain::sink::MemorySink;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    const SEED: u64 = 42;

    let target = DiagonalGaussian::new(
        vec![("x", -20.0, 20.0), ("y", -20.0, 20.0)],
        vec![1.0, -2.0],
        vec![1.0, 3.0],
    );

    let config = Config {
        number_of_chains: 4,
        seed: SEED,
        chunks: 20,
        chunk_size: 500,
        ..Config::default()
    };

    let mut sampler = Sampler::new(target, config)?;
    let mut sink = MemorySink::new();
    sampler.run_with_progress(&mut sink)?;

    let info = sampler.pre_run_info()?;
    println!(
        "prerun: converged = {}, iterations = {}, R-values = {:?}",
        info.converged, info.iterations, info.rvalue_parameters
    );

    let samples = sink.records();
    println!("generated {} samples", samples.len());

    let mean_x = samples.iter().map(|r| r.point[0]).sum::<f64>() / samples.len() as f64;
    let mean_y = samples.iter().map(|r| r.point[1]).sum::<f64>() / samples.len() as f64;
    println!("sample mean: ({:.2}, {:.2}), target mean: (1.00, -2.00)", mean_x, mean_y);

    let best = samples
        .iter()
        .max_by(|a, b| a.log_posterior.total_cmp(&b.log_posterior))
        .ok_or("no samples stored")?;
    println!(
        "best sample: ({:.2}, {:.2}) with log posterior {:.3}",
        best.point[0], best.point[1], best.log_posterior
    );

    Ok(())
}
