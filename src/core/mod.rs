pub mod duplicate;
pub mod hash;
pub mod index;
pub mod layout;
pub mod placement;
pub mod similarity;

pub use duplicate::{DuplicateGroup, DuplicateStats, duplicate_stats, group_duplicates};
pub use hash::{
    BitVector, DigestMap, DigestSet, ExactHash, HashError, HashOptions, HashService,
    PerceptualAlgorithm, Resolution,
};
pub use index::{DigestCache, DigestIndex};
pub use layout::{Layout, destination_path, local_time};
pub use placement::{
    ConfigError, FileError, MatchSource, PlacementConfig, PlacementDecision, PlacementEngine,
    PlacementLog, PlacementStats, ValidatedConfig,
};
pub use similarity::{CompareError, Comparator, SimilarityPolicy, SimilarityScore, compare};
