use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::flow::Rule;
use crate::stat::MetricEvent;
use crate::stat::ReadStat;
use crate::stat::SlidingWindowMetric;
use crate::system_metric::MemoryProbe;

/// Computes the number of tokens a rule allows right now.
#[derive(Debug)]
pub enum Calculator {
    Direct(DirectCalculator),
    WarmUp(WarmUpCalculator),
    MemoryAdaptive(MemoryAdaptiveCalculator),
}

impl Calculator {
    /// `stat` is the controller's read statistic, if it keeps one.
    pub fn calculate_allowed_tokens(&self, stat: Option<&SlidingWindowMetric>, now_ms: u64) -> f64 {
        match self {
            Calculator::Direct(c) => c.threshold,
            Calculator::WarmUp(c) => {
                let previous_qps = stat
                    .map(|s| s.get_previous_qps(MetricEvent::Pass))
                    .unwrap_or_default();
                c.calculate_allowed_tokens(previous_qps, now_ms)
            }
            Calculator::MemoryAdaptive(c) => c.calculate_allowed_tokens(),
        }
    }
}

#[derive(Debug)]
pub struct DirectCalculator {
    threshold: f64,
}

impl DirectCalculator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

/// Token bucket with a cold start.
///
/// The bucket starts full. While it holds more than `warning_token` tokens
/// the system is considered cold and the allowed rate is lowered along
/// `slope`, reaching `threshold / cold_factor` with a full bucket. Tokens
/// are consumed by the previous second's passed requests and refilled at
/// `threshold` per second.
#[derive(Debug)]
pub struct WarmUpCalculator {
    threshold: f64,
    cold_factor: u32,
    warning_token: i64,
    max_token: i64,
    slope: f64,
    stored_tokens: AtomicI64,
    last_filled_ms: AtomicU64,
}

impl WarmUpCalculator {
    /// A cold factor of 0 or 1 is replaced with `default_cold_factor`.
    pub fn new(rule: &Rule, default_cold_factor: u32) -> Self {
        let cold_factor = if rule.warm_up_cold_factor <= 1 {
            default_cold_factor
        } else {
            rule.warm_up_cold_factor
        };
        let period = f64::from(rule.warm_up_period_sec);
        let threshold = rule.threshold;
        let warning_token = (period * threshold / f64::from(cold_factor - 1)) as i64;
        let max_token = warning_token + (2.0 * period * threshold / (1.0 + f64::from(cold_factor))) as i64;
        let slope = (f64::from(cold_factor) - 1.0) / threshold / (max_token - warning_token) as f64;
        Self {
            threshold,
            cold_factor,
            warning_token,
            max_token,
            slope,
            stored_tokens: AtomicI64::new(0),
            last_filled_ms: AtomicU64::new(0),
        }
    }

    pub fn warning_token(&self) -> i64 {
        self.warning_token
    }

    pub fn max_token(&self) -> i64 {
        self.max_token
    }

    pub fn stored_tokens(&self) -> i64 {
        self.stored_tokens.load(Ordering::Acquire)
    }

    pub fn calculate_allowed_tokens(&self, previous_qps: f64, now_ms: u64) -> f64 {
        self.sync_token(previous_qps, now_ms);
        let rest = self.stored_tokens.load(Ordering::Acquire);
        if rest >= self.warning_token {
            let above = (rest - self.warning_token) as f64;
            next_up(1.0 / (above * self.slope + 1.0 / self.threshold))
        } else {
            self.threshold
        }
    }

    fn sync_token(&self, pass_qps: f64, now_ms: u64) {
        let now = now_ms - now_ms % 1000;
        let last_filled = self.last_filled_ms.load(Ordering::Acquire);
        if now <= last_filled {
            return;
        }
        let old = self.stored_tokens.load(Ordering::Acquire);
        let new = self.cool_down_tokens(old, now, last_filled, pass_qps);
        if self
            .stored_tokens
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let current = self.stored_tokens.fetch_sub(pass_qps as i64, Ordering::AcqRel) - pass_qps as i64;
            if current < 0 {
                self.stored_tokens.store(0, Ordering::Release);
            }
            self.last_filled_ms.store(now, Ordering::Release);
        }
    }

    fn cool_down_tokens(&self, old: i64, now: u64, last_filled: u64, pass_qps: f64) -> i64 {
        let refill = |old: i64| old + ((now - last_filled) as f64 * self.threshold / 1000.0) as i64;
        let new = if old < self.warning_token {
            refill(old)
        } else if old > self.warning_token
            && pass_qps < f64::from(self.threshold as u32 / self.cold_factor)
        {
            // Only refill a cold bucket while traffic stays well below the threshold.
            refill(old)
        } else {
            old
        };
        new.min(self.max_token)
    }
}

/// Smallest f64 greater than a positive finite `value`.
fn next_up(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        f64::from_bits(value.to_bits() + 1)
    } else {
        value
    }
}

/// Interpolates the threshold between two memory water marks.
#[derive(Debug)]
pub struct MemoryAdaptiveCalculator {
    low_mem_usage_threshold: f64,
    high_mem_usage_threshold: f64,
    mem_low_water_mark: i64,
    mem_high_water_mark: i64,
    probe: Arc<dyn MemoryProbe>,
}

impl MemoryAdaptiveCalculator {
    pub fn new(rule: &Rule, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            low_mem_usage_threshold: rule.low_mem_usage_threshold,
            high_mem_usage_threshold: rule.high_mem_usage_threshold,
            mem_low_water_mark: rule.mem_low_water_mark_bytes,
            mem_high_water_mark: rule.mem_high_water_mark_bytes,
            probe,
        }
    }

    pub fn calculate_allowed_tokens(&self) -> f64 {
        let Some(mem) = self.probe.current_memory_usage() else {
            return self.low_mem_usage_threshold;
        };
        if mem <= self.mem_low_water_mark {
            self.low_mem_usage_threshold
        } else if mem >= self.mem_high_water_mark {
            self.high_mem_usage_threshold
        } else {
            (self.high_mem_usage_threshold - self.low_mem_usage_threshold)
                / (self.mem_high_water_mark - self.mem_low_water_mark) as f64
                * (mem - self.mem_low_water_mark) as f64
                + self.low_mem_usage_threshold
        }
    }
}
