pub mod config;
pub mod run;
pub mod seed;
pub mod status;
