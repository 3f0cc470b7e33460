pub mod errors;
pub mod ids;
pub mod logging;
pub(crate) mod sync;
pub mod time;
