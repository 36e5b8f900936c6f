pub mod cancel;
pub mod context_cache;
pub mod correlation;
pub mod engine;
pub mod host;
pub mod progress;
pub mod protocol;

pub(crate) mod worker;
