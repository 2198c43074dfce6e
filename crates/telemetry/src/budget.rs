//! Cost ledger and budget enforcement.
//!
//! Every sealed `llm_call` span that carries a model and token counts is
//! priced and appended to the ledger. The running total is a single atomic
//! updated with compare-and-swap, so concurrent calls never lose spend and
//! exactly one of them observes the upward crossing of the threshold.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use llmscope_config::{BudgetAction, BudgetConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::TelemetryError;
use crate::model::SpanRecord;
use crate::pricing::PricingTable;
use crate::tracer::SpanProcessor;

/// One priced LLM call. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// `None` when the model has no known price.
    pub cost: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub span_id: String,
}

/// Raised once when accumulated spend first exceeds the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetExceeded {
    pub spent: f64,
    pub threshold: f64,
    pub currency: String,
    /// The call that pushed spend over the threshold.
    pub trace_id: String,
    pub span_id: String,
    pub at: DateTime<Utc>,
}

/// Aggregated spend over a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub currency: String,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub llm_calls: u64,
    /// Calls whose model had no price and contributed no cost.
    pub unpriced_calls: u64,
    pub trace_count: u64,
    /// Breakdown by model, most expensive first.
    pub by_model: Vec<ModelCost>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Spend attributed to one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCost {
    pub model: String,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

const SIGNAL_CAPACITY: usize = 16;

/// Prices LLM calls, keeps the ledger, and watches the budget.
pub struct CostMonitor {
    pricing: PricingTable,
    ledger: Mutex<Vec<Arc<LedgerEntry>>>,
    /// `f64` bits of the running total.
    total: AtomicU64,
    budget: Option<BudgetConfig>,
    signal: broadcast::Sender<BudgetExceeded>,
}

impl CostMonitor {
    pub fn new(pricing: PricingTable, budget: Option<BudgetConfig>) -> Self {
        let (signal, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            pricing,
            ledger: Mutex::new(Vec::new()),
            total: AtomicU64::new(0f64.to_bits()),
            budget,
            signal,
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn budget(&self) -> Option<&BudgetConfig> {
        self.budget.as_ref()
    }

    /// Accumulated spend since start or the last [`CostMonitor::reset`].
    pub fn spent(&self) -> f64 {
        f64::from_bits(self.total.load(Ordering::Acquire))
    }

    pub fn is_over_budget(&self) -> bool {
        self.budget
            .as_ref()
            .is_some_and(|b| self.spent() > b.threshold)
    }

    /// Receiver for budget crossings. Slow receivers may lag and miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<BudgetExceeded> {
        self.signal.subscribe()
    }

    /// Build the ledger entry for a call, pricing it from the table.
    pub fn price(
        &self,
        model_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        trace_id: &str,
        span_id: &str,
    ) -> LedgerEntry {
        LedgerEntry {
            model_id: model_id.to_string(),
            input_tokens,
            output_tokens,
            cost: self.pricing.compute_cost(model_id, input_tokens, output_tokens),
            timestamp: Utc::now(),
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
        }
    }

    /// Append `entry` and add its cost to the running total.
    ///
    /// Returns the signal if this entry moved spend from at-or-below the
    /// threshold to above it. Subscribers receive the same value.
    pub fn accumulate(&self, entry: LedgerEntry) -> Option<BudgetExceeded> {
        let cost = entry.cost;
        let entry = Arc::new(entry);
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&entry));

        let Some(cost) = cost else {
            debug!(model = %entry.model_id, "No price for model, cost not accumulated");
            return None;
        };
        if !cost.is_finite() {
            warn!(model = %entry.model_id, cost, "Non-finite cost, not accumulated");
            return None;
        }
        if cost <= 0.0 {
            return None;
        }

        let mut current = self.total.load(Ordering::Acquire);
        let (previous, updated) = loop {
            let previous = f64::from_bits(current);
            let updated = previous + cost;
            match self.total.compare_exchange_weak(
                current,
                updated.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break (previous, updated),
                Err(actual) => current = actual,
            }
        };

        let budget = self.budget.as_ref()?;
        if previous > budget.threshold || updated <= budget.threshold {
            return None;
        }

        let exceeded = BudgetExceeded {
            spent: updated,
            threshold: budget.threshold,
            currency: budget.currency.clone(),
            trace_id: entry.trace_id.clone(),
            span_id: entry.span_id.clone(),
            at: Utc::now(),
        };
        warn!(
            spent = updated,
            threshold = budget.threshold,
            currency = %budget.currency,
            trace_id = %entry.trace_id,
            "Budget exceeded"
        );
        // No subscribers is fine.
        let _ = self.signal.send(exceeded.clone());
        Some(exceeded)
    }

    /// Zero the running total and re-arm the signal. The ledger is kept.
    pub fn reset(&self) {
        self.total.store(0f64.to_bits(), Ordering::Release);
        debug!("Budget total reset");
    }

    /// Gate for starting new LLM work.
    ///
    /// Over budget with the `deny` policy this fails; with `warn` it logs
    /// and admits. Work already in flight is never affected.
    pub fn admit(&self) -> Result<(), TelemetryError> {
        let Some(budget) = &self.budget else {
            return Ok(());
        };
        let spent = self.spent();
        if spent <= budget.threshold {
            return Ok(());
        }
        match budget.on_exceed {
            BudgetAction::Deny => Err(TelemetryError::BudgetExceeded {
                spent,
                threshold: budget.threshold,
                currency: budget.currency.clone(),
            }),
            BudgetAction::Warn => {
                warn!(
                    spent,
                    threshold = budget.threshold,
                    currency = %budget.currency,
                    "Over budget, admitting call"
                );
                Ok(())
            }
        }
    }

    /// Snapshot of the ledger in append order.
    pub fn ledger(&self) -> Vec<Arc<LedgerEntry>> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Summarize ledger entries with timestamps within `[from, to]`.
    pub fn cost_summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CostSummary {
        let ledger = self.ledger();

        let mut summary = CostSummary {
            total_cost: 0.0,
            currency: self
                .budget
                .as_ref()
                .map(|b| b.currency.clone())
                .unwrap_or_else(|| "USD".into()),
            total_input_tokens: 0,
            total_output_tokens: 0,
            llm_calls: 0,
            unpriced_calls: 0,
            trace_count: 0,
            by_model: Vec::new(),
            from,
            to,
        };
        let mut traces = HashSet::new();
        let mut by_model: BTreeMap<&str, ModelCost> = BTreeMap::new();

        for entry in ledger.iter().filter(|e| e.timestamp >= from && e.timestamp <= to) {
            traces.insert(entry.trace_id.as_str());
            summary.llm_calls += 1;
            summary.total_input_tokens += entry.input_tokens;
            summary.total_output_tokens += entry.output_tokens;
            match entry.cost {
                Some(cost) => summary.total_cost += cost,
                None => summary.unpriced_calls += 1,
            }

            let model = by_model
                .entry(entry.model_id.as_str())
                .or_insert_with(|| ModelCost {
                    model: entry.model_id.clone(),
                    cost: 0.0,
                    input_tokens: 0,
                    output_tokens: 0,
                    calls: 0,
                });
            model.cost += entry.cost.unwrap_or(0.0);
            model.input_tokens += entry.input_tokens;
            model.output_tokens += entry.output_tokens;
            model.calls += 1;
        }

        summary.trace_count = traces.len() as u64;
        summary.by_model = by_model.into_values().collect();
        summary.by_model.sort_by(|a, b| b.cost.total_cmp(&a.cost));
        summary
    }
}

impl SpanProcessor for CostMonitor {
    fn name(&self) -> &str {
        "cost"
    }

    fn on_end(&self, span: &Arc<SpanRecord>) -> Result<(), TelemetryError> {
        if let Some((model, input, output)) = span.token_usage() {
            let entry = self.price(model, input, output, &span.trace_id, &span.span_id);
            self.accumulate(entry);
        }
        Ok(())
    }
}
