//! Destination side of the pipeline: stream-tag encoding, the metric line
//! buffer, the management API, broker TLS and metric submission.

pub mod api;
pub mod broker;
pub mod check;
pub mod error;
pub mod sample;
pub mod submit;
pub mod tags;

pub use check::{CheckConfig, DestinationCheck, MetricSink};
pub use error::{CheckError, Result};
pub use sample::MetricBuffer;
