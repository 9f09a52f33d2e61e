pub mod patcher;

pub use patcher::Patch;
