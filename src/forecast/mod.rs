pub mod consumption;
pub mod history;
pub mod prices;

pub use consumption::*;
pub use history::*;
pub use prices::*;
