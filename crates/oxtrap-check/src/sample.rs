use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use oxtrap_common::types::{MetricSample, MetricType, MetricValue};
use serde::Serialize;

use crate::error::{CheckError, Result};

/// Longest encoded metric name (name plus stream tags) the broker accepts.
pub const MAX_METRIC_NAME_LEN: usize = 4096;

#[derive(Serialize)]
struct SampleBody<'a> {
    #[serde(rename = "_type")]
    metric_type: &'static str,
    #[serde(rename = "_value")]
    value: &'a MetricValue,
    #[serde(rename = "_ts", skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

/// Newline delimited JSON payload for one submission.
///
/// Each line is `{"<name>":{"_type":"n","_value":1.5,"_ts":1700000000000}}`.
/// The buffer is reused between submissions via [`MetricBuffer::reset`].
#[derive(Debug, Default)]
pub struct MetricBuffer {
    buf: Vec<u8>,
    samples: usize,
    trace: bool,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every written line at debug level when `trace` is set.
    pub fn with_trace(trace: bool) -> Self {
        Self {
            trace,
            ..Self::default()
        }
    }

    pub fn is_traced(&self) -> bool {
        self.trace
    }

    pub fn write(&mut self, sample: &MetricSample) -> Result<()> {
        self.write_sample(
            &sample.name,
            sample.metric_type,
            &sample.value,
            sample.timestamp,
        )
    }

    /// Appends one sample line.
    ///
    /// Over-long names and non-finite floats are dropped with a warning and
    /// do not count as errors.
    pub fn write_sample(
        &mut self,
        name: &str,
        metric_type: MetricType,
        value: &MetricValue,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(CheckError::InvalidMetric("empty metric name".to_string()));
        }
        if !value.fits(metric_type) {
            return Err(CheckError::InvalidMetric(format!(
                "value {value} cannot be sent as type {metric_type} ({name})"
            )));
        }
        if name.len() > MAX_METRIC_NAME_LEN {
            tracing::warn!(
                metric_name = %name,
                encoded_len = name.len(),
                max_len = MAX_METRIC_NAME_LEN,
                "max metric name length exceeded, discarding"
            );
            return Ok(());
        }
        if let MetricValue::Float(v) = value {
            if !v.is_finite() {
                tracing::warn!(metric_name = %name, value = %v, "non-finite value, discarding");
                return Ok(());
            }
        }

        let body = SampleBody {
            metric_type: metric_type.code(),
            value,
            timestamp: timestamp.map(|ts| ts.timestamp_millis()),
        };
        let line = BTreeMap::from([(name, body)]);
        let start = self.buf.len();
        serde_json::to_writer(&mut self.buf, &line)?;
        if self.trace {
            tracing::debug!(metric = %String::from_utf8_lossy(&self.buf[start..]), "writing");
        }
        self.buf.push(b'\n');
        self.samples += 1;
        Ok(())
    }

    /// Number of lines written since the last reset.
    pub fn len(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.samples = 0;
    }
}
