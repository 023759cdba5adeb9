//! JMX监控集群：嵌入模式下的应用组装、健康检查和优雅关闭

pub mod app;
pub mod health;
pub mod shutdown;

pub use app::Application;
pub use shutdown::ShutdownManager;
