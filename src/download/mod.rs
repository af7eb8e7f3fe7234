mod coordinator;
mod retry;

pub use coordinator::{run, Coordinator, DownloadConfig, DownloadHooks, Progress, ShutdownHandle};
pub use retry::{Backoff, RetryPolicy};
