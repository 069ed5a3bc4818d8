mod dataset;
mod loader;

pub use dataset::*;
pub use loader::*;
