//! Token budget allocation for one model call.
//!
//! The window splits into system prompt, bootstrap, history, and response
//! slices by configured ratios, with a hard floor on response tokens. After
//! the actual prompt and bootstrap render, unused slack and the reserve are
//! reclaimed into history. Over-budget prompts never silently shrink
//! history — they surface a warning while history stays honest.

use openclaw_types::config::BudgetConfig;

/// Per-call allocation in tokens. Components sum to ≤ the context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetPlan {
    pub system_prompt: u64,
    pub bootstrap: u64,
    pub history: u64,
    pub response: u64,
    pub reserve: u64,
}

impl BudgetPlan {
    pub fn total(&self) -> u64 {
        self.system_prompt + self.bootstrap + self.history + self.response + self.reserve
    }
}

/// Result of reclaiming unused prompt slack into the history slice.
#[derive(Debug, Clone)]
pub struct ReclaimedBudget {
    /// The honest history budget after reclamation.
    pub history: u64,
    /// Over-budget warnings (system prompt or bootstrap exceeding their slice).
    pub warnings: Vec<String>,
}

/// Split a context window by the configured ratios.
///
/// The response floor is honored by shrinking history, never the system
/// prompt or bootstrap slices. A zero window degenerates to a 1-token plan.
pub fn allocate(window: u64, config: &BudgetConfig) -> BudgetPlan {
    if window == 0 {
        return BudgetPlan {
            system_prompt: 0,
            bootstrap: 0,
            history: 0,
            response: 1,
            reserve: 0,
        };
    }

    let system_prompt = (window as f64 * config.system_prompt_ratio).floor() as u64;
    let bootstrap = (window as f64 * config.bootstrap_ratio).floor() as u64;
    let mut history = (window as f64 * config.history_ratio).floor() as u64;
    let ratio_response = (window as f64 * config.response_ratio).floor() as u64;
    let response = ratio_response.max(config.min_response_tokens);

    // The floor ate into the window beyond its ratio share: history pays.
    let deficit = response - ratio_response;
    history = history.saturating_sub(deficit);

    let used = system_prompt + bootstrap + history + response;
    let reserve = window.saturating_sub(used);

    BudgetPlan {
        system_prompt,
        bootstrap,
        history,
        response,
        reserve,
    }
}

/// Fold unused prompt slack and the reserve into history.
///
/// `actual_system` and `actual_bootstrap` are the rendered token counts.
/// Overruns produce warnings; the returned history budget is the plan's
/// history plus whatever genuinely went unused.
pub fn reclaim(plan: &BudgetPlan, actual_system: u64, actual_bootstrap: u64) -> ReclaimedBudget {
    let mut history = plan.history + plan.reserve;
    let mut warnings = Vec::new();

    if actual_system <= plan.system_prompt {
        history += plan.system_prompt - actual_system;
    } else {
        warnings.push(format!(
            "system prompt over budget: {actual_system} tokens > {} allotted",
            plan.system_prompt
        ));
    }

    if actual_bootstrap <= plan.bootstrap {
        history += plan.bootstrap - actual_bootstrap;
    } else {
        warnings.push(format!(
            "bootstrap over budget: {actual_bootstrap} tokens > {} allotted",
            plan.bootstrap
        ));
    }

    ReclaimedBudget { history, warnings }
}
