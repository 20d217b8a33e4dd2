pub mod atomic;
pub mod constants;
pub mod json_path;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod time;

pub use atomic::write_atomic;
pub use constants::*;
pub use logging::init_logging;
pub use progress::ProgressReporter;
pub use retry::with_local_retries;
pub use time::{parse_timestamp, parse_timestamp_str};
