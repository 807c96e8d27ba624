//! Host connections, target resolution, fan-out and uploads

pub mod fanout;
pub mod manager;
pub mod resolver;
pub mod upload;

pub use fanout::{fan_out, Command, ExecFailure, HostExecutor, HostResult, Payload, DEFAULT_TIMEOUT};
pub use manager::SshManager;
pub use resolver::{parse_selector, resolve, Selector, TargetKind};
pub use upload::{FileProgress, TaskItem, TaskStatus, TempSpool, UploadRegistry};
