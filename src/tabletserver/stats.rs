//! Counters exported on `/debug/vars`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::Code;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Timing {
    pub count: u64,
    pub total_ns: u64,
}

#[derive(Default)]
pub struct TabletStats {
    error_counters: Mutex<BTreeMap<String, i64>>,
    internal_errors: Mutex<BTreeMap<String, i64>>,
    query_timings: Mutex<BTreeMap<String, Timing>>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct TabletStatsSnapshot {
    pub errors: BTreeMap<String, i64>,
    pub internal_errors: BTreeMap<String, i64>,
    pub query_timings: BTreeMap<String, Timing>,
}

impl TabletStats {
    pub fn count_error(&self, code: Code) {
        *self
            .error_counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(code.as_str().to_string())
            .or_default() += 1;
    }

    pub fn count_internal(&self, kind: &str) {
        *self
            .internal_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind.to_string())
            .or_default() += 1;
    }

    pub fn record_timing(&self, method: &str, elapsed: Duration) {
        let mut timings = self
            .query_timings
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let t = timings.entry(method.to_string()).or_default();
        t.count += 1;
        t.total_ns += elapsed.as_nanos() as u64;
    }

    pub fn error_count(&self, code: Code) -> i64 {
        self.error_counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn internal_count(&self, kind: &str) -> i64 {
        self.internal_errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> TabletStatsSnapshot {
        TabletStatsSnapshot {
            errors: self
                .error_counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            internal_errors: self
                .internal_errors
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            query_timings: self
                .query_timings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
