pub mod collector;
pub mod model;
pub mod scope;
pub mod snapshot;

pub use collector::{CollectorConfig, FlushReport, TraceCollector};
pub use model::{SpanRecord, TraceRecord};
pub use scope::{SpanHandle, SpanRef, TraceScope};
pub use snapshot::SnapshotLimits;
