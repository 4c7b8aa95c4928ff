pub mod battery;
pub mod device;
pub mod schedule;
pub mod types;

pub use battery::*;
pub use device::*;
pub use schedule::*;
pub use types::*;
