pub mod archive;
pub mod carryforward;
pub mod cli;
pub mod config;
pub mod coverage;
pub mod diff;
pub mod editable;
pub mod error;
pub mod file;
pub mod filter;
pub mod ingest;
pub mod matcher;
pub mod merge;
pub mod model;
pub mod parsers;
pub mod report;
pub mod session;
pub mod shadow;
pub mod store;
pub mod totals;
