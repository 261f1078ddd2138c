mod counting_result_codec;
mod message_processor;

pub use counting_result_codec::*;
pub use message_processor::*;
