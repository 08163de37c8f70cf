pub mod block;
pub mod error;
pub mod field_ops;
pub mod ids;
pub mod interval_set;
pub mod operations;
pub mod presence;
pub mod row_range;
pub mod time;

pub use block::{Block, BlockIdAllocator, CellWrite};
pub use error::CoreError;
pub use field_ops::{FieldOp, FieldPath};
pub use ids::*;
pub use interval_set::{IntervalSet, RowRange};
pub use row_range::RowRangeTracker;
pub use time::{Clock, ManualClock, Millis, SystemClock};
