//! 歌单校验模块
//!
//! - `types.rs`: 候选曲目与校验结果
//! - `source.rs`: 候选曲目来源（ListenBrainz 推荐歌单）
//! - `availability.rs`: 曲库可用性检查
//! - `pipeline.rs`: 有界并发的校验流水线

pub mod availability;
pub mod pipeline;
pub mod source;
pub mod types;

pub use availability::{Availability, AvailabilityChecker, AvailabilityError, CatalogAvailabilityChecker};
pub use pipeline::{PipelineError, ValidationPipeline};
pub use source::{CandidateSource, ListenBrainzSource, StaticCandidateSource};
pub use types::{CandidateTrack, ValidatedTrack, ValidationReport};
