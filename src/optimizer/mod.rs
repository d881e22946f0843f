pub mod constraints;
pub mod fallback;
pub mod horizon;

pub use constraints::*;
pub use fallback::*;
pub use horizon::*;
