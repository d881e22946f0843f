pub mod inputs;
pub mod reliability;

pub use inputs::*;
pub use reliability::*;
