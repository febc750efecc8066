//! Budgeted repair of failed turns.
//!
//! The engine only ever proposes: a `RepairProposal` is never applied
//! until the caller resubmits it as a new turn. Each proposal attempt
//! consumes one unit of the session's troubleshoot budget, whether or
//! not the backend produced anything usable, and the counter never goes
//! back down.

use std::sync::Arc;

use riff_protocol::{FailedTurn, RepairProposal, SessionSnapshot};
use tracing::info;

use crate::backend::{BackendChain, FailureContext, GenerateRequest};
use crate::error::{Result, RiffError};
use crate::normalize;
use crate::store::Store;
use crate::validate;

/// Ceiling on any proposal's confidence: a repaired guess is never
/// presented as certain.
const MAX_CONFIDENCE: f32 = 0.95;

pub struct RepairEngine {
    chain: Arc<BackendChain>,
    store: Arc<Store>,
}

impl RepairEngine {
    pub fn new(chain: Arc<BackendChain>, store: Arc<Store>) -> Self {
        Self { chain, store }
    }

    /// Produce a corrected command list for a failed turn, or explain
    /// why one cannot be produced. Consumes budget up front.
    pub async fn propose(
        &self,
        session_id: &str,
        failed: &FailedTurn,
        snapshot: &SessionSnapshot,
    ) -> Result<RepairProposal> {
        // Charge before calling out: a failed attempt still spends. The
        // store's check-and-spend is atomic, so concurrent proposals at
        // the last unit cannot overshoot the limit.
        let Some(budget) = self.store.spend_budget(session_id)? else {
            let budget = self.store.budget(session_id)?;
            return Err(RiffError::BudgetExhausted {
                used: budget.used,
                limit: budget.limit,
            });
        };
        info!(used = budget.used, limit = budget.limit, "troubleshoot attempt");

        let request = GenerateRequest {
            prompt: failed.prompt.clone(),
            intent: failed.intent,
            snapshot: snapshot.clone(),
            failure: Some(FailureContext {
                failed_commands: failed.commands.clone(),
                violations: failed.violations.clone(),
            }),
        };
        let reply = self.chain.generate(&request).await?;

        let (fixed, notes) = normalize::normalize(&reply.commands);
        let (_, report) = validate::validate(&fixed, snapshot);
        if !report.valid {
            return Err(RiffError::RepairInvalid {
                reasons: report.messages().join("; "),
            });
        }

        let mut confidence = reply.confidence.min(MAX_CONFIDENCE);
        if !notes.is_empty() {
            confidence *= 0.9;
        }
        let reason = format!(
            "resolves: {}",
            failed
                .violations
                .iter()
                .map(|v| v.message.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        );

        Ok(RepairProposal {
            fixed_commands: fixed,
            model: reply.model,
            confidence,
            reason,
            normalization_notes: notes,
            budget,
        })
    }
}
