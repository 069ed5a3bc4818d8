mod checkpoint;
mod clip;
mod config;
mod lr;
mod snapshot;
mod state;
mod trainer;

pub use checkpoint::*;
pub use clip::*;
pub use config::*;
pub use lr::*;
pub use snapshot::*;
pub use state::*;
pub use trainer::*;
