mod counting_result;
mod result;

pub use counting_result::*;
pub use result::*;
