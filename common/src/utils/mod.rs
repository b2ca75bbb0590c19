pub mod canonical;
pub mod config;
pub mod embedding;
pub mod token_estimate;
