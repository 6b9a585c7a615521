//! Address-space-only sub-allocation.
//!
//! Nothing in this crate touches GPU memory. [`VirtualBlock`] hands out
//! aligned byte ranges inside a fixed-size region that some other component
//! owns and reports occupancy statistics; the buffer and texture managers
//! keep one block per physical upload buffer / placed-resource heap. Freeing
//! goes through a consuming token, so a range cannot be released twice or
//! into the wrong block.

#![forbid(unsafe_code)]

mod align;
mod virtual_block;

pub use align::{align_up, is_power_of_two};
pub use virtual_block::{BlockStatistics, VirtualAllocation, VirtualBlock, VirtualBlockError};
