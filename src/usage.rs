//! UsageLedger: an append-only, concurrently-writable log of token usage
//! per provider call, filterable by model/provider/user/time.

use crate::message::TokenUsage;
use chrono::{DateTime, Utc};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub record_id: String,
    pub agent_name: String,
    pub model: String,
    pub provider: String,
    pub user_id: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct UsageLedger {
    records: RwLock<Vec<UsageRecord>>,
}

#[derive(Default, Clone)]
pub struct UsageFilter {
    pub model: Option<String>,
    pub provider: Option<String>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        agent_name: impl Into<String>,
        model: impl Into<String>,
        provider: impl Into<String>,
        user_id: Option<String>,
        usage: TokenUsage,
    ) -> UsageRecord {
        let record = UsageRecord {
            record_id: format!("usage_{}", uuid::Uuid::new_v4().simple()),
            agent_name: agent_name.into(),
            model: model.into(),
            provider: provider.into(),
            user_id,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            recorded_at: Utc::now(),
        };
        self.records.write().unwrap().push(record.clone());
        record
    }

    pub fn filter(&self, filter: &UsageFilter) -> Vec<UsageRecord> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| filter.model.as_deref().map_or(true, |m| m == r.model))
            .filter(|r| filter.provider.as_deref().map_or(true, |p| p == r.provider))
            .filter(|r| {
                filter
                    .user_id
                    .as_deref()
                    .map_or(true, |u| r.user_id.as_deref() == Some(u))
            })
            .filter(|r| filter.since.map_or(true, |since| r.recorded_at >= since))
            .cloned()
            .collect()
    }

    pub fn total(&self) -> TokenUsage {
        let records = self.records.read().unwrap();
        let prompt = records.iter().map(|r| r.prompt_tokens).sum();
        let completion = records.iter().map(|r| r.completion_tokens).sum();
        TokenUsage::new(prompt, completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_filterable_by_model_and_provider() {
        let ledger = UsageLedger::new();
        ledger.record("bot", "gpt-5", "openai", None, TokenUsage::new(10, 5));
        ledger.record("bot", "claude-4", "anthropic", None, TokenUsage::new(20, 8));

        let openai_only = ledger.filter(&UsageFilter {
            provider: Some("openai".into()),
            ..Default::default()
        });
        assert_eq!(openai_only.len(), 1);
        assert_eq!(openai_only[0].model, "gpt-5");
    }

    #[test]
    fn total_sums_all_records() {
        let ledger = UsageLedger::new();
        ledger.record("bot", "gpt-5", "openai", None, TokenUsage::new(10, 5));
        ledger.record("bot", "gpt-5", "openai", None, TokenUsage::new(1, 1));
        let total = ledger.total();
        assert_eq!(total.prompt_tokens, 11);
        assert_eq!(total.completion_tokens, 6);
    }
}
