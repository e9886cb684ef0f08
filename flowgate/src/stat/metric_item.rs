use std::fmt::Write;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Local;

use crate::error::Error;
use crate::error::Result;

const SEPARATOR: char = '|';

/// Per-second aggregate of one resource, as written to the metric log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricItem {
    pub resource: String,
    pub classification: i32,
    /// Start of the second, in unix milliseconds.
    pub timestamp: u64,

    pub pass_qps: u64,
    pub block_qps: u64,
    pub complete_qps: u64,
    pub error_qps: u64,
    pub avg_rt: u64,
    pub occupied_pass_qps: u64,
    pub concurrency: u32,

    pub blocked_by_flow: u64,
    pub blocked_by_isolation: u64,
    pub blocked_by_circuit_breaking: u64,
    pub blocked_by_system: u64,
    pub blocked_by_hot_spot: u64,
    pub blocked_by_mock: u64,
}

impl MetricItem {
    /// `timestamp|formatted time|resource|pass|block|complete|error|avgRt|occupiedPass|concurrency|classification|flow|isolation|circuit|system|hotspot|mock`
    ///
    /// Pipes inside the resource name are replaced by `-`.
    pub fn to_fat_string(&self) -> String {
        let time = DateTime::from_timestamp_millis(self.timestamp as i64)
            .map(|t| {
                t.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default();
        let mut line = String::with_capacity(128);
        let _ = write!(line, "{}|{}|", self.timestamp, time);
        self.write_tail(&mut line);
        line
    }

    /// Same as [`MetricItem::to_fat_string`] without the formatted time.
    pub fn to_thin_string(&self) -> String {
        let mut line = String::with_capacity(96);
        let _ = write!(line, "{}|", self.timestamp);
        self.write_tail(&mut line);
        line
    }

    fn write_tail(&self, line: &mut String) {
        let _ = write!(
            line,
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.resource.replace(SEPARATOR, "-"),
            self.pass_qps,
            self.block_qps,
            self.complete_qps,
            self.error_qps,
            self.avg_rt,
            self.occupied_pass_qps,
            self.concurrency,
            self.classification,
            self.blocked_by_flow,
            self.blocked_by_isolation,
            self.blocked_by_circuit_breaking,
            self.blocked_by_system,
            self.blocked_by_hot_spot,
            self.blocked_by_mock,
        );
    }

    /// Parses a fat line. The first eight fields are mandatory; anything after
    /// them was added by later versions of the format and defaults to zero.
    pub fn from_fat_string(line: &str) -> Result<Self> {
        let invalid = || Error::InvalidMetricLine(line.to_string());
        if line.is_empty() {
            return Err(invalid());
        }
        let parts: Vec<&str> = line.split(SEPARATOR).collect();
        if parts.len() < 8 {
            return Err(invalid());
        }

        fn field<T: FromStr + Default>(parts: &[&str], idx: usize) -> Option<T> {
            match parts.get(idx) {
                Some(raw) => raw.trim().parse().ok(),
                None => Some(T::default()),
            }
        }
        let num = |idx| field::<u64>(&parts, idx).ok_or_else(invalid);

        Ok(Self {
            timestamp: num(0)?,
            resource: parts[2].to_string(),
            pass_qps: num(3)?,
            block_qps: num(4)?,
            complete_qps: num(5)?,
            error_qps: num(6)?,
            avg_rt: num(7)?,
            occupied_pass_qps: num(8)?,
            concurrency: field(&parts, 9).ok_or_else(invalid)?,
            classification: field(&parts, 10).ok_or_else(invalid)?,
            blocked_by_flow: num(11)?,
            blocked_by_isolation: num(12)?,
            blocked_by_circuit_breaking: num(13)?,
            blocked_by_system: num(14)?,
            blocked_by_hot_spot: num(15)?,
            blocked_by_mock: num(16)?,
        })
    }
}
