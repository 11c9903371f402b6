pub mod aggregate;
pub mod bucket;
pub mod cli;
pub mod config;
pub mod ingest;
pub mod pipeline;
pub mod storage;
pub mod web;
