mod item;
mod status;

pub use item::{Batch, BatchSummary, NewWorkItem, WorkItem};
pub use status::{CorrectionType, WorkStatus};
