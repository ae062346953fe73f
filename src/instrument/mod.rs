//! Software instruments and parameters used to drive measurements.
pub mod parameter;
pub mod timestamp;

pub use parameter::{ParamValue, Parameter};
pub use timestamp::TimeStampInstrument;
