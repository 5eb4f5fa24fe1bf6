pub mod bids;
pub mod command;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fs_util;
pub mod logger;
pub mod mapping;
pub mod qc;
pub mod series;
