mod args;
mod driver;
mod proc;
mod progress;
mod reader;
mod time_range;
mod types;
mod write;

pub use args::*;
pub use driver::{ChromProber, ChromProberError, DEFAULT_CONFIG_FILE, ENV_PREFIX};
pub use progress::ProgressRecord;
pub use time_range::{TimeRange, TimeRangeParseError};
pub use write::TargetRecord;
