pub mod domain;
pub mod nats;
pub mod result_worker;

pub use domain::*;
pub use nats::*;
pub use result_worker::*;
