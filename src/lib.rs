pub mod common;
pub mod compile_info;
pub mod dispatch;
pub mod elementwise;
pub mod norm;
pub mod reduce;
pub mod serialize;
pub mod shapes;
pub mod tensorspec;
pub mod tiling;
pub mod transpose;
pub mod utils;

// Re-exported for the `shape!` macro.
pub use smallvec;
