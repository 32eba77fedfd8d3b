#![cfg_attr(not(test), no_std)]

pub mod capture;
pub mod config;
pub mod correlation;
pub mod identity;
pub mod pipeline;
pub mod record;
pub mod size;

pub use config::{ArgType, CaptureConfig, CaptureShape, ProbeConfig};
pub use correlation::{thread_key, CorrelationTable, RetprobeEntry};
pub use identity::ProcessIdentity;
pub use pipeline::{EventSink, Outcome, RetprobePipeline, ReturnContext, ScratchSlots};
pub use record::{MessageRecord, ARGS_CAPACITY, HEADER_SIZE, MAX_RECORD_SIZE};

#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for ProbeConfig {}
}
