pub mod plan;
pub mod timing;

pub use plan::{build_plan_reminders, schedule_plan_reminders, DRAFT_TEXT_MAX_CHARS};
pub use timing::{parse_step_due_date, parse_timing_offset};
