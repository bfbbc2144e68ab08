pub mod dedup;

pub use dedup::{DedupError, DedupService, RegistrationOutcome};
