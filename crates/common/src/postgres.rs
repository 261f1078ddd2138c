mod client;
mod config;
mod counting_result_repository;

pub use client::*;
pub use config::*;
pub use counting_result_repository::*;
