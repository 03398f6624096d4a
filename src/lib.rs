pub mod chain;
pub mod cluster;
pub mod density;
pub mod error;
pub mod pool;
pub mod proposal;
pub mod rvalue;
pub mod sampler;
pub mod sink;
