//! Local mirror of a Spotify library: incremental sync into SQLite plus
//! offline search, duplicate detection and statistics.

pub mod analytics;
pub mod cli;
pub mod config;
pub mod dump;
pub mod logging;
pub mod oauth_flow;
pub mod setup;
pub mod storage;
pub mod sync;
pub mod token_provider;
