pub mod afl;
pub mod config;
pub mod matcher;
pub mod profile;
pub mod replay;
pub mod seed;
pub mod series;
pub mod stats;
pub mod store;

pub use afl::{PlotPoint, read_plot_data, replace_placeholder};
pub use config::{ConfigError, CovmeldConfig, MemLimit, ResolvedTools, resolve_tool};
pub use matcher::{BugMatcher, CallbackMatcher, PatternMatcher};
pub use profile::{
    PipelineError, ProfileExport, ProfilePipeline, RegionSummary, read_region_json,
};
pub use replay::{CoverageObservation, ReplayError, ReplayStatus, SeedReplayer};
pub use seed::{SeedCategory, SeedError, SeedRecord, discover_seeds, write_timestamps};
pub use series::{MergedSeries, SeriesError, TrialSeries};
pub use stats::{BootstrapEstimate, StatsError, bootstrap_mean, coverage_auc};
pub use store::{StoreError, TrialStore};

mod tests {
    #[test]
    fn it_works() {
        let result = 2 + 2;
        assert_eq!(result, 4);
    }
}
