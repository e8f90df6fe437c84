//! Day partitions and the date ranges that select them

pub mod key;
pub mod range;

pub use key::PartitionKey;
pub use range::{expand_range, DateRange, RangeControl, RangePreset};
