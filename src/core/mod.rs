pub mod calculator;
pub mod duplicate;
pub mod fs;
pub mod hash;
pub mod ids;
pub mod jobs;
pub mod video;

pub use calculator::{CalculatorError, CalculatorFactory, HashCalculator};
pub use duplicate::{DuplicateGrouper, MatchRule, ScanSummary};
pub use fs::{FileSystem, LocalFileSystem};
pub use hash::{HashError, HashService};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidGenerator};
pub use jobs::{Job, JobError, JobQueue};
pub use video::{FfmpegVideoService, VideoError, VideoService};
