pub mod shared;
pub mod suggestion;
