mod client;
mod consumer_types;
mod traits;

pub use client::*;
pub use consumer_types::*;
pub use traits::*;
