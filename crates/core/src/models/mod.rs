pub mod request;
pub mod target;
pub mod worker;

pub use request::{Command, RequestMessage};
pub use target::{ConfigBlob, MonitoredTarget, OwnerPayload, OwnershipRecord};
pub use worker::WorkerMetadata;
