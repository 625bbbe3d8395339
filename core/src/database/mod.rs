pub mod batch_size;
pub mod capabilities;
pub mod postgres;
pub mod sql;
