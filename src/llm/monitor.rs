use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Approximate price per 1K tokens.
const PRICING: &[(&str, f64)] = &[
    ("gpt-4.1", 0.01),
    ("gpt-4.1-mini", 0.0005),
    ("gpt-4-turbo-preview", 0.01),
    ("gpt-4", 0.03),
    ("gpt-4o", 0.005),
    ("gpt-4o-mini", 0.00015),
    ("gpt-3.5-turbo", 0.001),
];

const DEFAULT_RATE: f64 = 0.01;

pub fn estimated_cost(model: &str, tokens: u64) -> f64 {
    let rate = match PRICING.iter().find(|(m, _)| *m == model) {
        Some((_, r)) => *r,
        None => {
            warn!("model '{}' not in pricing table, assuming ${} per 1K tokens", model, DEFAULT_RATE);
            DEFAULT_RATE
        }
    };
    tokens as f64 / 1000.0 * rate
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiCall {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub tokens: u64,
    pub duration_secs: f64,
    pub success: bool,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorStats {
    pub api_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub total_tokens: u64,
    pub total_duration_secs: f64,
    pub estimated_cost: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl MonitorStats {
    pub fn success_rate(&self) -> f64 {
        if self.api_calls == 0 { 0.0 } else { self.successful_calls as f64 / self.api_calls as f64 * 100.0 }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let attempts = self.cache_hits + self.cache_misses;
        if attempts == 0 { 0.0 } else { self.cache_hits as f64 / attempts as f64 * 100.0 }
    }
}

#[derive(Debug, Default)]
struct Inner {
    stats: MonitorStats,
    calls: Vec<ApiCall>,
}

#[derive(Serialize)]
struct Report<'a> {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    stats: &'a MonitorStats,
    calls: &'a [ApiCall],
}

/// Thread-safe accumulator of API usage for one run.
#[derive(Debug)]
pub struct UsageMonitor {
    started_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

impl Default for UsageMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageMonitor {
    pub fn new() -> Self {
        Self { started_at: Utc::now(), inner: Mutex::new(Inner::default()) }
    }

    pub fn record_call(&self, model: &str, tokens: u64, duration: Duration, success: bool) {
        let call = ApiCall {
            timestamp: Utc::now(),
            model: model.to_string(),
            tokens,
            duration_secs: duration.as_secs_f64(),
            success,
            estimated_cost: estimated_cost(model, tokens),
        };
        debug!("api call: model={} tokens={} duration={:.2}s success={}", model, tokens, call.duration_secs, success);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.stats.api_calls += 1;
        if success {
            inner.stats.successful_calls += 1;
        } else {
            inner.stats.failed_calls += 1;
        }
        inner.stats.total_tokens += tokens;
        inner.stats.total_duration_secs += call.duration_secs;
        inner.stats.estimated_cost += call.estimated_cost;
        inner.calls.push(call);
    }

    pub fn record_cache_hit(&self) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).stats.cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).stats.cache_misses += 1;
    }

    pub fn stats(&self) -> MonitorStats {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).stats.clone()
    }

    pub fn summary(&self) -> String {
        let s = self.stats();
        format!(
            "API calls: {} (ok {}, failed {}, {:.1}% success), tokens: {}, time: {:.2}s, est. cost: ${:.4}, cache: {} hits / {} misses ({:.1}%)",
            s.api_calls,
            s.successful_calls,
            s.failed_calls,
            s.success_rate(),
            s.total_tokens,
            s.total_duration_secs,
            s.estimated_cost,
            s.cache_hits,
            s.cache_misses,
            s.cache_hit_rate()
        )
    }

    pub fn log_summary(&self) {
        info!("{}", self.summary());
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let report = Report { started_at: self.started_at, finished_at: Utc::now(), stats: &inner.stats, calls: &inner.calls };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&report)?;
        fs::write(path, body).with_context(|| format!("writing usage report {}", path.display()))?;
        info!("usage report saved to {}", path.display());
        Ok(())
    }
}
