mod array;
mod duration;

pub use array::{partition, partition_ranges, PartitionError};
pub use duration::format_duration;
