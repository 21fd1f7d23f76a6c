//! Per-relay health bookkeeping and read ranking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Latency assumed for relays we have never heard from
const UNKNOWN_LATENCY: Duration = Duration::from_millis(800);
/// Weight of the newest sample in the latency moving average
const LATENCY_ALPHA: f64 = 0.3;
/// Penalty applied right after a failure, decaying with `FAILURE_DECAY`
const FAILURE_PENALTY: f64 = 0.5;
const FAILURE_DECAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct EndpointHealth {
    pub success_count: u32,
    pub failure_count: u32,
    pub smoothed_latency: Option<Duration>,
    pub last_success_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
}

impl EndpointHealth {
    pub fn record_success(&mut self, latency: Duration, now: Instant) {
        self.success_count = self.success_count.saturating_add(1);
        self.last_success_at = Some(now);
        self.smoothed_latency = Some(match self.smoothed_latency {
            None => latency,
            Some(prev) => {
                prev.mul_f64(1.0 - LATENCY_ALPHA) + latency.mul_f64(LATENCY_ALPHA)
            }
        });
    }

    /// A streamed event counts as a success without a latency sample.
    pub fn record_delivery(&mut self, now: Instant) {
        self.success_count = self.success_count.saturating_add(1);
        self.last_success_at = Some(now);
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
    }

    /// Laplace-smoothed success rate
    pub fn success_rate(&self) -> f64 {
        (self.success_count as f64 + 1.0) / (self.success_count as f64 + self.failure_count as f64 + 2.0)
    }

    /// Higher is better.
    pub fn score(&self, now: Instant) -> f64 {
        let latency = self.smoothed_latency.unwrap_or(UNKNOWN_LATENCY);
        let latency_factor = 1.0 / (1.0 + latency.as_secs_f64());

        let penalty = match self.last_failure_at {
            // A success after the failure means the relay recovered.
            Some(failed) if self.last_success_at.map_or(true, |ok| ok < failed) => {
                let age = now.saturating_duration_since(failed).as_secs_f64();
                FAILURE_PENALTY * (-age / FAILURE_DECAY.as_secs_f64()).exp()
            }
            _ => 0.0,
        };

        self.success_rate() * latency_factor - penalty
    }
}

/// Health of every relay seen this session
#[derive(Debug, Default)]
pub struct HealthTable {
    entries: HashMap<String, EndpointHealth>,
}

impl HealthTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, url: &str, latency: Duration) {
        self.entries
            .entry(url.to_string())
            .or_default()
            .record_success(latency, Instant::now());
    }

    pub fn record_delivery(&mut self, url: &str) {
        self.entries
            .entry(url.to_string())
            .or_default()
            .record_delivery(Instant::now());
    }

    pub fn record_failure(&mut self, url: &str) {
        self.entries
            .entry(url.to_string())
            .or_default()
            .record_failure(Instant::now());
    }

    pub fn get(&self, url: &str) -> Option<&EndpointHealth> {
        self.entries.get(url)
    }

    pub fn snapshot(&self) -> Vec<(String, EndpointHealth)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Best first; equal scores keep their input order.
    pub fn rank(&self, urls: &[String], now: Instant) -> Vec<String> {
        let default = EndpointHealth::default();
        let mut scored: Vec<(f64, &String)> = urls
            .iter()
            .map(|u| (self.entries.get(u).unwrap_or(&default).score(now), u))
            .collect();
        // sort_by is stable
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, u)| u.clone()).collect()
    }
}
