use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::pipeline::round_usd;

/// Answer of the limits service for one organization.
#[derive(Debug, Clone, PartialEq)]
pub enum Quota {
    Allowed,
    Exhausted { reason: String },
}

/// Organization budget and rate policy, consulted before every stage.
#[async_trait]
pub trait LimitsService: Send + Sync {
    async fn authorize(&self, organization_id: &str) -> Quota;

    async fn record_spend(&self, organization_id: &str, cost_usd: f64);
}

/// Per-organization USD budgets kept in memory.
///
/// Organizations without an explicit budget fall back to `default_budget`;
/// `None` means unlimited.
#[derive(Default)]
pub struct InMemoryLimits {
    budgets: HashMap<String, f64>,
    default_budget: Option<f64>,
    spent: Mutex<HashMap<String, f64>>,
}

impl InMemoryLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_default_budget(mut self, usd: f64) -> Self {
        self.default_budget = Some(usd);
        self
    }

    pub fn with_budget(mut self, organization_id: impl Into<String>, usd: f64) -> Self {
        self.budgets.insert(organization_id.into(), usd);
        self
    }

    pub fn spent(&self, organization_id: &str) -> f64 {
        self.spent.lock().get(organization_id).copied().unwrap_or(0.0)
    }

    fn budget_for(&self, organization_id: &str) -> Option<f64> {
        self.budgets
            .get(organization_id)
            .copied()
            .or(self.default_budget)
    }
}

#[async_trait]
impl LimitsService for InMemoryLimits {
    async fn authorize(&self, organization_id: &str) -> Quota {
        let Some(budget) = self.budget_for(organization_id) else {
            return Quota::Allowed;
        };
        let spent = self.spent(organization_id);
        if spent >= budget {
            Quota::Exhausted {
                reason: format!("spent ${spent:.6} of ${budget:.6} budget"),
            }
        } else {
            Quota::Allowed
        }
    }

    async fn record_spend(&self, organization_id: &str, cost_usd: f64) {
        let mut spent = self.spent.lock();
        let total = spent.entry(organization_id.to_string()).or_insert(0.0);
        *total = round_usd(*total + cost_usd);
    }
}
