mod queue_listener;
mod transport_error_reporter;

pub use queue_listener::*;
pub use transport_error_reporter::*;
