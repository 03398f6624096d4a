//! End-to-end sampling of a 1D unit Gaussian with two chains started far
//! apart, serially and through the thread pool.
//!
//! The chains begin at -5 and +5, well into the tails, so the prerun has to
//! both tune the proposal scales and wait for the histories to mix before
//! it may declare convergence.

use multichain::density::DiagonalGaussian;
use multichain::pool::ThreadPool;
use multichain::sampler::{Config, Sampler};
use multichain::sink::MemorySink;

fn unit_gaussian() -> DiagonalGaussian {
    DiagonalGaussian::new(vec![("x", -10.0, 10.0)], vec![0.0], vec![1.0])
}

fn two_chain_config(parallelize: bool) -> Config {
    Config {
        number_of_chains: 2,
        seed: 42,
        parallelize,
        use_posterior_rvalue: true,
        prerun_iterations_update: 500,
        prerun_iterations_min: 500,
        prerun_iterations_max: 5000,
        chunks: 20,
        chunk_size: 500,
        ..Config::default()
    }
}

fn run_scenario(mut sampler: Sampler<DiagonalGaussian>) {
    sampler
        .set_start_points(&[vec![-5.0], vec![5.0]])
        .expect("two valid start points");

    let mut sink = MemorySink::new();
    sampler.run(&mut sink).expect("sampling should succeed");

    let info = sampler.pre_run_info().expect("prerun ran");
    assert!(
        info.converged,
        "prerun did not converge within {} iterations (R-values {:?})",
        info.iterations, info.rvalue_parameters
    );
    assert!(
        info.rvalue_posterior < 1.1,
        "posterior R-value {} too large",
        info.rvalue_posterior
    );
    for (d, r) in info.rvalue_parameters.iter().enumerate() {
        assert!(*r < 1.1, "parameter {} R-value {} too large", d, r);
    }

    // 20 chunks of 500 per chain
    assert_eq!(sink.records().len(), 2 * 20 * 500);

    for chain in 0..2 {
        let samples: Vec<f64> = sink.chain_records(chain).map(|r| r.point[0]).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!(
            mean.abs() < 0.2,
            "chain {} mean {} too far from the target mean 0",
            chain,
            mean
        );
    }
}

#[test]
fn distant_chains_converge_serially() {
    let sampler = Sampler::new(unit_gaussian(), two_chain_config(false)).unwrap();
    run_scenario(sampler);
}

#[test]
fn distant_chains_converge_through_the_pool() {
    let pool = ThreadPool::new(Some(2));
    let sampler = Sampler::with_pool(unit_gaussian(), two_chain_config(true), pool).unwrap();
    run_scenario(sampler);
}
