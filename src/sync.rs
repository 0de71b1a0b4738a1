//! Reconciliation core: snapshot join, update planning, dispatch.
//!
//! `build_plan` is pure: it joins the two inventory snapshots by SKU and
//! emits the minimal, ordered set of updates. `dispatch` pushes the plan
//! through an `UpdateSink` one item at a time, retrying recoverable errors
//! with bounded exponential backoff and isolating per-item failures from
//! the run. The only condition that stops a run mid-plan is the CLF
//! token-issuance quota (`ApiError::TokenLimitExceeded`), which trips the
//! circuit breaker and returns a summary flagged `halted`.

use crate::error::ApiError;
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

/// Maximum attempts per plan item, counting the first call.
pub const MAX_DISPATCH_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// One distributor stock entry. Quantities are normalized to zero or more
/// before they reach this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockRecord {
    pub sku: String,
    pub quantity: u32,
}

/// One storefront inventory entry; `variant_id` is the mutation handle,
/// `sku` is the join key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRecord {
    pub sku: String,
    pub variant_id: String,
    pub quantity: u32,
}

/// One pending mutation, derived per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePlanItem {
    pub sku: String,
    pub variant_id: String,
    pub from_quantity: u32,
    pub to_quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Success,
    Skipped(String),
    Failed(String),
}

/// Outcome for one considered SKU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateResult {
    pub sku: String,
    pub outcome: UpdateOutcome,
}

/// Ordered plan plus the skip outcomes recorded at planning time.
#[derive(Debug, Clone)]
pub struct Plan {
    pub items: Vec<UpdatePlanItem>,
    pub skipped: Vec<UpdateResult>,
    pub total_considered: usize,
}

/// Aggregated outcome of one run, finalized once dispatch returns.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total_considered: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub halted: bool,
    /// Per-SKU skip and failure reasons, in dispatch order.
    pub errors: Vec<(String, String)>,
}

/// Destination for inventory mutations. The Shopify client implements
/// this; tests substitute scripted sinks.
pub trait UpdateSink {
    fn set_inventory_level(&mut self, variant_id: &str, quantity: u32) -> Result<(), ApiError>;
}

/// Join the stock snapshot against the inventory snapshot by SKU.
///
/// Plan items come out in the iteration order of `stock`, so a run is
/// reproducible given the same input order. SKUs missing from the
/// inventory are recorded as skips, never errors; equal quantities emit
/// nothing, conserving rate-limit budget on no-op updates.
pub fn build_plan(stock: &[StockRecord], inventory: &[InventoryRecord]) -> Plan {
    // Last write wins on duplicate SKUs; duplicates are a data-quality
    // anomaly, not an error.
    let mut by_sku: HashMap<&str, &InventoryRecord> = HashMap::new();
    for record in inventory {
        by_sku.insert(record.sku.as_str(), record);
    }

    let mut items = Vec::new();
    let mut skipped = Vec::new();
    for record in stock {
        match by_sku.get(record.sku.as_str()) {
            None => skipped.push(UpdateResult {
                sku: record.sku.clone(),
                outcome: UpdateOutcome::Skipped("product not found".to_string()),
            }),
            Some(matched) if matched.quantity == record.quantity => {}
            Some(matched) => items.push(UpdatePlanItem {
                sku: record.sku.clone(),
                variant_id: matched.variant_id.clone(),
                from_quantity: matched.quantity,
                to_quantity: record.quantity,
            }),
        }
    }

    Plan {
        items,
        skipped,
        total_considered: stock.len(),
    }
}

/// Delay before retry number `attempt` (1-based): doubling from one
/// second, capped at one minute. Pure, so the policy tests without a
/// network or a clock.
pub fn backoff_schedule(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(6);
    (BASE_DELAY * factor).min(MAX_DELAY)
}

/// Dispatch the plan, blocking on real backoff delays.
pub fn dispatch(plan: &Plan, sink: &mut dyn UpdateSink) -> RunSummary {
    dispatch_with(plan, sink, &mut thread::sleep)
}

/// Dispatch with an injected sleeper, for tests.
pub fn dispatch_with(
    plan: &Plan,
    sink: &mut dyn UpdateSink,
    sleep: &mut dyn FnMut(Duration),
) -> RunSummary {
    let mut summary = RunSummary {
        total_considered: plan.total_considered,
        ..RunSummary::default()
    };
    for result in &plan.skipped {
        record(&mut summary, result.clone());
    }

    'items: for item in &plan.items {
        let mut attempt = 1u32;
        loop {
            match sink.set_inventory_level(&item.variant_id, item.to_quantity) {
                Ok(()) => {
                    tracing::info!(
                        target: "update",
                        sku = %item.sku,
                        variant_id = %item.variant_id,
                        from = item.from_quantity,
                        to = item.to_quantity,
                        "inventory level updated"
                    );
                    record(
                        &mut summary,
                        UpdateResult {
                            sku: item.sku.clone(),
                            outcome: UpdateOutcome::Success,
                        },
                    );
                    break;
                }
                Err(ApiError::TokenLimitExceeded) => {
                    // Circuit breaker: continuing without a token would
                    // fail every remaining item the same way.
                    tracing::error!(sku = %item.sku, "token limit exceeded, halting dispatch");
                    summary.halted = true;
                    record(
                        &mut summary,
                        UpdateResult {
                            sku: item.sku.clone(),
                            outcome: UpdateOutcome::Failed(
                                ApiError::TokenLimitExceeded.to_string(),
                            ),
                        },
                    );
                    break 'items;
                }
                Err(ApiError::NotFound(message)) => {
                    tracing::warn!(sku = %item.sku, "update target missing, skipping");
                    record(
                        &mut summary,
                        UpdateResult {
                            sku: item.sku.clone(),
                            outcome: UpdateOutcome::Skipped(message),
                        },
                    );
                    break;
                }
                Err(err) if err.is_recoverable() && attempt < MAX_DISPATCH_ATTEMPTS => {
                    // A server-provided Retry-After hint overrides the
                    // computed schedule.
                    let delay = match &err {
                        ApiError::RateLimited {
                            retry_after: Some(hint),
                        } => *hint,
                        _ => backoff_schedule(attempt),
                    };
                    tracing::warn!(
                        sku = %item.sku,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying update"
                    );
                    sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(sku = %item.sku, attempt, error = %err, "update failed");
                    record(
                        &mut summary,
                        UpdateResult {
                            sku: item.sku.clone(),
                            outcome: UpdateOutcome::Failed(err.to_string()),
                        },
                    );
                    break;
                }
            }
        }
    }

    summary
}

fn record(summary: &mut RunSummary, result: UpdateResult) {
    match result.outcome {
        UpdateOutcome::Success => summary.updated += 1,
        UpdateOutcome::Skipped(reason) => {
            summary.skipped += 1;
            summary.errors.push((result.sku, reason));
        }
        UpdateOutcome::Failed(message) => {
            summary.failed += 1;
            summary.errors.push((result.sku, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSink {
        responses: VecDeque<Result<(), ApiError>>,
        calls: Vec<(String, u32)>,
    }

    impl ScriptedSink {
        fn new(responses: Vec<Result<(), ApiError>>) -> Self {
            ScriptedSink {
                responses: responses.into(),
                calls: Vec::new(),
            }
        }
    }

    impl UpdateSink for ScriptedSink {
        fn set_inventory_level(
            &mut self,
            variant_id: &str,
            quantity: u32,
        ) -> Result<(), ApiError> {
            self.calls.push((variant_id.to_string(), quantity));
            self.responses.pop_front().unwrap_or(Ok(()))
        }
    }

    fn stock(entries: &[(&str, u32)]) -> Vec<StockRecord> {
        entries
            .iter()
            .map(|(sku, quantity)| StockRecord {
                sku: sku.to_string(),
                quantity: *quantity,
            })
            .collect()
    }

    fn inventory(entries: &[(&str, &str, u32)]) -> Vec<InventoryRecord> {
        entries
            .iter()
            .map(|(sku, variant_id, quantity)| InventoryRecord {
                sku: sku.to_string(),
                variant_id: variant_id.to_string(),
                quantity: *quantity,
            })
            .collect()
    }

    fn no_sleep() -> impl FnMut(Duration) {
        |_| {}
    }

    #[test]
    fn plan_emits_one_item_per_differing_sku() {
        let plan = build_plan(
            &stock(&[("A", 5), ("B", 0)]),
            &inventory(&[("A", "v1", 3)]),
        );
        assert_eq!(
            plan.items,
            vec![UpdatePlanItem {
                sku: "A".to_string(),
                variant_id: "v1".to_string(),
                from_quantity: 3,
                to_quantity: 5,
            }]
        );
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].sku, "B");
        assert_eq!(
            plan.skipped[0].outcome,
            UpdateOutcome::Skipped("product not found".to_string())
        );
        assert_eq!(plan.total_considered, 2);
    }

    #[test]
    fn equal_quantities_emit_no_item() {
        let plan = build_plan(&stock(&[("A", 3)]), &inventory(&[("A", "v1", 3)]));
        assert!(plan.items.is_empty());
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn plan_preserves_stock_order() {
        let plan = build_plan(
            &stock(&[("C", 1), ("A", 2), ("B", 3)]),
            &inventory(&[("A", "va", 0), ("B", "vb", 0), ("C", "vc", 0)]),
        );
        let order: Vec<&str> = plan.items.iter().map(|item| item.sku.as_str()).collect();
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn duplicate_inventory_skus_last_write_wins() {
        let plan = build_plan(
            &stock(&[("A", 9)]),
            &inventory(&[("A", "old", 1), ("A", "new", 2)]),
        );
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].variant_id, "new");
        assert_eq!(plan.items[0].from_quantity, 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_schedule(1), Duration::from_secs(1));
        assert_eq!(backoff_schedule(2), Duration::from_secs(2));
        assert_eq!(backoff_schedule(3), Duration::from_secs(4));
        assert_eq!(backoff_schedule(7), Duration::from_secs(60));
        assert_eq!(backoff_schedule(40), Duration::from_secs(60));
    }

    #[test]
    fn dispatch_counts_successes_and_planning_skips() {
        let plan = build_plan(
            &stock(&[("A", 5), ("B", 0)]),
            &inventory(&[("A", "v1", 3)]),
        );
        let mut sink = ScriptedSink::new(vec![Ok(())]);
        let summary = dispatch_with(&plan, &mut sink, &mut no_sleep());
        assert_eq!(summary.total_considered, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(!summary.halted);
        assert_eq!(sink.calls, vec![("v1".to_string(), 5)]);
    }

    #[test]
    fn rate_limited_twice_then_success_retries_and_succeeds() {
        let plan = build_plan(&stock(&[("A", 5)]), &inventory(&[("A", "v1", 3)]));
        let mut sink = ScriptedSink::new(vec![
            Err(ApiError::RateLimited { retry_after: None }),
            Err(ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(7)),
            }),
            Ok(()),
        ]);
        let mut delays = Vec::new();
        let summary = dispatch_with(&plan, &mut sink, &mut |delay| delays.push(delay));
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(sink.calls.len(), 3);
        // First retry follows the schedule, second honors the hint.
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(7)]);
    }

    #[test]
    fn exhausted_retries_fail_the_item_but_not_the_run() {
        let plan = build_plan(
            &stock(&[("A", 5), ("B", 7)]),
            &inventory(&[("A", "va", 3), ("B", "vb", 4)]),
        );
        let mut responses: Vec<Result<(), ApiError>> = (0..MAX_DISPATCH_ATTEMPTS)
            .map(|_| Err(ApiError::Network("reset".to_string())))
            .collect();
        responses.push(Ok(()));
        let mut sink = ScriptedSink::new(responses);
        let summary = dispatch_with(&plan, &mut sink, &mut no_sleep());
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(sink.calls.len(), MAX_DISPATCH_ATTEMPTS as usize + 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].0, "A");
    }

    #[test]
    fn non_recoverable_error_fails_immediately() {
        let plan = build_plan(&stock(&[("A", 5)]), &inventory(&[("A", "v1", 3)]));
        let mut sink = ScriptedSink::new(vec![Err(ApiError::Authentication(
            "401".to_string(),
        ))]);
        let summary = dispatch_with(&plan, &mut sink, &mut no_sleep());
        assert_eq!(summary.failed, 1);
        assert_eq!(sink.calls.len(), 1);
    }

    #[test]
    fn not_found_during_dispatch_is_a_skip() {
        let plan = build_plan(&stock(&[("A", 5)]), &inventory(&[("A", "v1", 3)]));
        let mut sink =
            ScriptedSink::new(vec![Err(ApiError::NotFound("variant v1".to_string()))]);
        let summary = dispatch_with(&plan, &mut sink, &mut no_sleep());
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(sink.calls.len(), 1);
    }

    #[test]
    fn token_limit_halts_remaining_items() {
        let plan = build_plan(
            &stock(&[("A", 5), ("B", 7), ("C", 9)]),
            &inventory(&[("A", "va", 3), ("B", "vb", 4), ("C", "vc", 6)]),
        );
        let mut sink = ScriptedSink::new(vec![Ok(()), Err(ApiError::TokenLimitExceeded)]);
        let summary = dispatch_with(&plan, &mut sink, &mut no_sleep());
        assert!(summary.halted);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.failed, 1);
        // C was never attempted.
        assert_eq!(sink.calls.len(), 2);
    }

    #[test]
    fn dispatch_is_idempotent_once_inventory_matches() {
        let stock = stock(&[("A", 5), ("B", 2)]);
        let before = inventory(&[("A", "va", 3), ("B", "vb", 2)]);
        let first = build_plan(&stock, &before);
        assert_eq!(first.items.len(), 1);

        // Re-plan against the post-dispatch inventory state.
        let after = inventory(&[("A", "va", 5), ("B", "vb", 2)]);
        let second = build_plan(&stock, &after);
        assert!(second.items.is_empty());
    }
}
