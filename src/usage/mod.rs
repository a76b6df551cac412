pub mod reconciler;
pub mod sampler;
pub mod stats;
