pub mod config;
pub mod dataset;
pub mod errors;
pub mod stats;
pub mod trainer;

pub use dataset::*;
pub use errors::*;
pub use stats::*;
pub use trainer::*;
