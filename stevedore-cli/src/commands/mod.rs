//! CLI command implementations

use clap::builder::{PossibleValuesParser, TypedValueParser};
use stevedore_core::CacheLevel;

pub mod build;
pub mod cache;
pub mod init;

/// Parses `--cache-level` and lists the backends in `--help`.
pub fn cache_level_parser() -> impl TypedValueParser<Value = CacheLevel> {
    PossibleValuesParser::new(CacheLevel::ALL.map(|level| level.as_str()))
        .try_map(|s| CacheLevel::parse(&s).ok_or_else(|| format!("unknown cache level: {}", s)))
}
