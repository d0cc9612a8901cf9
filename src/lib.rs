pub mod config;
pub mod error;
pub mod provider;
pub mod review;
pub mod types;
