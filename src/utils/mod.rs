//! Process-level helpers shared by the library and the bridge binary.

pub mod bootstrap;
pub mod retry;
