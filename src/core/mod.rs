pub mod cache;
pub mod matcher;
pub mod normalize;
pub mod orchestrator;
pub mod report;
pub mod resume;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, SnapshotCache};
pub use matcher::{reconcile, MatchOutcome};
pub use normalize::{canonical_relative_path, normalize};
pub use orchestrator::{CompareEngine, EngineDeps, TenantSide};
pub use report::{summarize, ResultStore, RunSummary};
pub use resume::run_or_resume;
