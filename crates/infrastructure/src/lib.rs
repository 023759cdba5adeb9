//! 协调服务客户端实现

pub mod in_memory_coordination;

pub use in_memory_coordination::{InMemoryClient, InMemoryCoordinationService};
