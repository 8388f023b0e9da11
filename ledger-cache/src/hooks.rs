//! Collaborator boundaries
//!
//! The ledger knows nothing about chat commands, HUDs or player sessions.
//! It talks to the outside world through two narrow traits:
//!
//! - [`BalanceHook`]: synchronous pre-commit check that may veto or adjust
//!   a balance change
//! - [`SessionDirectory`]: which accounts are currently active, and what
//!   they are called

use crate::types::AccountId;
use rust_decimal::Decimal;
use std::sync::Arc;

/// What triggered a balance change. Transfers are not vetoable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    Deposit,
    Withdraw,
    /// Administrative overwrite
    Set,
}

/// Proposed balance change, handed to hooks before it is applied
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceChange<'a> {
    pub account: AccountId,
    pub current: Decimal,
    pub proposed: Decimal,
    pub cause: ChangeCause,
    pub reason: &'a str,
}

/// Hook verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    /// Let the change through unmodified
    Allow,
    /// Cancel the change; nothing is mutated or logged
    Deny,
    /// Replace the target balance. The adjusted value is validated the
    /// same way the original was.
    Adjust(Decimal),
}

/// Pre-commit balance hook.
///
/// Hooks run while the account lock is held, so they must not call back
/// into the ledger.
pub trait BalanceHook: Send + Sync {
    fn before_change(&self, change: &BalanceChange<'_>) -> HookDecision;
}

/// Adapter turning a closure into a hook
pub struct FnHook<F>(F);

impl<F> BalanceHook for FnHook<F>
where
    F: Fn(&BalanceChange<'_>) -> HookDecision + Send + Sync,
{
    fn before_change(&self, change: &BalanceChange<'_>) -> HookDecision {
        (self.0)(change)
    }
}

/// Wrap a closure as a shareable hook
pub fn hook_fn<F>(f: F) -> Arc<dyn BalanceHook>
where
    F: Fn(&BalanceChange<'_>) -> HookDecision + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

/// Source of session liveness and display names
pub trait SessionDirectory: Send + Sync {
    /// Accounts that must stay resident in the cache
    fn active_accounts(&self) -> Vec<AccountId>;

    /// Display name for an account, if the session layer knows one
    fn display_name(&self, account: AccountId) -> Option<String>;
}

/// Directory with no sessions at all
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSessions;

impl SessionDirectory for NoSessions {
    fn active_accounts(&self) -> Vec<AccountId> {
        Vec::new()
    }

    fn display_name(&self, _account: AccountId) -> Option<String> {
        None
    }
}

/// Run hooks in registration order and fold their verdicts.
///
/// The first `Deny` wins. An `Adjust` rewrites the proposal seen by later
/// hooks. Returns the final target balance, or `None` when vetoed.
pub(crate) fn evaluate(
    hooks: &[Arc<dyn BalanceHook>],
    mut change: BalanceChange<'_>,
) -> Option<Decimal> {
    for hook in hooks {
        match hook.before_change(&change) {
            HookDecision::Allow => {}
            HookDecision::Deny => return None,
            HookDecision::Adjust(target) => change.proposed = target,
        }
    }
    Some(change.proposed)
}
