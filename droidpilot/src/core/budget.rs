//! Replan iteration budget: the loop's backpressure and deadlock guard.

use serde::Serialize;

/// Which limit stopped the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BudgetExhausted {
    Replans { used: u32, max: u32 },
    DialogIterations { used: u32, max: u32 },
}

impl BudgetExhausted {
    pub fn describe(&self) -> String {
        match self {
            Self::Replans { used, max } => {
                format!("replan limit reached ({used}/{max}) without a verdict")
            }
            Self::DialogIterations { used, max } => {
                format!("obstacle-clearing limit reached ({used}/{max}) without a verdict")
            }
        }
    }
}

/// Counts replanning passes.
///
/// When `count_dialog_iterations` is false, passes that follow an
/// obstacle-clearing action draw from a separate `max_dialog_iterations` pool
/// instead of `max_replans`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationBudget {
    max_replans: u32,
    count_dialog_iterations: bool,
    max_dialog_iterations: u32,
    replans: u32,
    dialog_iterations: u32,
}

impl IterationBudget {
    pub fn new(max_replans: u32, count_dialog_iterations: bool, max_dialog_iterations: u32) -> Self {
        Self {
            max_replans,
            count_dialog_iterations,
            max_dialog_iterations,
            replans: 0,
            dialog_iterations: 0,
        }
    }

    /// Charge one replanning pass, failing once the relevant pool is spent.
    pub fn charge(&mut self, after_dialog_action: bool) -> Result<(), BudgetExhausted> {
        if after_dialog_action && !self.count_dialog_iterations {
            if self.dialog_iterations >= self.max_dialog_iterations {
                return Err(BudgetExhausted::DialogIterations {
                    used: self.dialog_iterations,
                    max: self.max_dialog_iterations,
                });
            }
            self.dialog_iterations += 1;
            return Ok(());
        }
        if self.replans >= self.max_replans {
            return Err(BudgetExhausted::Replans {
                used: self.replans,
                max: self.max_replans,
            });
        }
        self.replans += 1;
        Ok(())
    }

    /// Replanning passes charged against `max_replans`.
    pub fn replans(&self) -> u32 {
        self.replans
    }

    pub fn dialog_iterations(&self) -> u32 {
        self.dialog_iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_budget_counts_dialog_iterations() {
        let mut budget = IterationBudget::new(2, true, 0);
        assert!(budget.charge(true).is_ok());
        assert!(budget.charge(false).is_ok());
        assert_eq!(
            budget.charge(false),
            Err(BudgetExhausted::Replans { used: 2, max: 2 })
        );
    }

    #[test]
    fn separate_dialog_pool_leaves_replans_untouched() {
        let mut budget = IterationBudget::new(1, false, 2);
        assert!(budget.charge(true).is_ok());
        assert!(budget.charge(true).is_ok());
        assert_eq!(budget.replans(), 0);
        assert_eq!(
            budget.charge(true),
            Err(BudgetExhausted::DialogIterations { used: 2, max: 2 })
        );
        assert!(budget.charge(false).is_ok());
        assert!(budget.charge(false).is_err());
    }
}
