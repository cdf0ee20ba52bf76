mod stats;
mod store;
mod sync;
mod vault;

pub use stats::*;
pub use store::*;
pub use sync::*;
pub use vault::*;
