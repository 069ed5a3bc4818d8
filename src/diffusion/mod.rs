mod ddpm;
mod forward;
mod objective;
mod pipeline;
mod schedule;
mod scheduler;
mod utils;

pub use ddpm::*;
pub use forward::*;
pub use objective::*;
pub use pipeline::*;
pub use schedule::*;
pub use scheduler::*;
pub use utils::*;
