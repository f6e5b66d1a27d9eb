//! Token usage accounting for planning calls.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::LlmResponse;

/// One provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub command_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn from_response(
        provider: &str,
        response: &LlmResponse,
        latency_ms: u64,
        command_id: Option<&str>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            model: response.model.clone(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            latency_ms,
            command_id: command_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Sink for usage records. Implementations must not block for long; the
/// planner calls this inline.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsageRecorder;

impl UsageRecorder for NoopUsageRecorder {
    fn record(&self, _record: UsageRecord) {}
}

/// Cumulative totals for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageTotals {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// In-memory ledger keeping every record.
#[derive(Debug, Default)]
pub struct UsageLedger {
    records: Mutex<Vec<UsageRecord>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().expect("usage ledger lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("usage ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn totals(&self) -> UsageTotals {
        let records = self.records.lock().expect("usage ledger lock poisoned");
        records.iter().fold(UsageTotals::default(), |mut acc, r| {
            acc.requests += 1;
            acc.input_tokens += r.input_tokens;
            acc.output_tokens += r.output_tokens;
            acc
        })
    }

    pub fn totals_by_provider(&self) -> BTreeMap<String, UsageTotals> {
        let records = self.records.lock().expect("usage ledger lock poisoned");
        let mut out: BTreeMap<String, UsageTotals> = BTreeMap::new();
        for r in records.iter() {
            let entry = out.entry(r.provider.clone()).or_default();
            entry.requests += 1;
            entry.input_tokens += r.input_tokens;
            entry.output_tokens += r.output_tokens;
        }
        out
    }
}

impl UsageRecorder for UsageLedger {
    fn record(&self, record: UsageRecord) {
        self.records
            .lock()
            .expect("usage ledger lock poisoned")
            .push(record);
    }
}
