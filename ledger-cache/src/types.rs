//! Core types for the ledger cache
//!
//! All types are designed for:
//! - Stable serialization across backends (bincode, JSON, SQL rows)
//! - Exact arithmetic (Decimal for money)
//! - Cheap cloning into snapshots (leaderboard, flush batches)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque 128-bit account identifier, assigned by the caller's identity system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Wrap an existing UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Random identifier (tests, tooling)
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits followed by an ellipsis, used when no
    /// display name is known
    pub fn short_name(&self) -> String {
        let mut s = self.0.to_string();
        s.truncate(8);
        s.push_str("...");
        s
    }
}

impl From<Uuid> for AccountId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Balance and lifetime statistics of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Account identifier
    pub id: AccountId,

    /// Last known human-readable name
    #[serde(default)]
    pub display_name: Option<String>,

    /// Current balance, never negative
    pub balance: Decimal,

    /// Lifetime credits (informational)
    pub total_earned: Decimal,

    /// Lifetime debits (informational)
    pub total_spent: Decimal,

    /// Summary of the most recent mutation
    #[serde(default)]
    pub last_transaction: String,

    /// Time of the most recent mutation
    #[serde(default)]
    pub last_transaction_at: Option<DateTime<Utc>>,
}

impl AccountRecord {
    /// Empty record with a zero balance
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            display_name: None,
            balance: Decimal::ZERO,
            total_earned: Decimal::ZERO,
            total_spent: Decimal::ZERO,
            last_transaction: String::new(),
            last_transaction_at: None,
        }
    }

    /// Fresh account holding the starting balance
    pub fn with_starting_balance(id: AccountId, starting_balance: Decimal, reason: &str) -> Self {
        let mut record = Self::new(id);
        record.overwrite(starting_balance, reason);
        record
    }

    /// Whether the balance covers `amount`
    pub fn has_balance(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Add to the balance and lifetime earnings. Callers validate limits;
    /// the lifetime counter saturates.
    pub fn credit(&mut self, amount: Decimal, reason: &str) {
        self.balance += amount;
        self.total_earned = self.total_earned.saturating_add(amount);
        self.touch(format!("+{} ({})", amount, reason));
    }

    /// Remove from the balance and add to lifetime spending. Callers
    /// validate funds.
    pub fn debit(&mut self, amount: Decimal, reason: &str) {
        self.balance -= amount;
        self.total_spent = self.total_spent.saturating_add(amount);
        self.touch(format!("-{} ({})", amount, reason));
    }

    /// Administrative overwrite, clamped at zero
    pub fn overwrite(&mut self, amount: Decimal, reason: &str) {
        self.balance = amount.max(Decimal::ZERO);
        self.touch(format!("Set to {} ({})", self.balance, reason));
    }

    fn touch(&mut self, summary: String) {
        self.last_transaction = summary;
        self.last_transaction_at = Some(Utc::now());
    }
}

/// Kind of a logged ledger event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionKind {
    /// Administrative deposit
    Give = 1,
    /// Administrative withdrawal
    Take = 2,
    /// Administrative overwrite
    Set = 3,
    /// Administrative reset
    Reset = 4,
    /// Account-to-account transfer
    Pay = 5,
    /// Ordinary deposit
    Earn = 6,
    /// Ordinary withdrawal
    Spend = 7,
}

impl TransactionKind {
    /// Stable storage code
    pub fn code(&self) -> &'static str {
        match self {
            TransactionKind::Give => "GIVE",
            TransactionKind::Take => "TAKE",
            TransactionKind::Set => "SET",
            TransactionKind::Reset => "RESET",
            TransactionKind::Pay => "PAY",
            TransactionKind::Earn => "EARN",
            TransactionKind::Spend => "SPEND",
        }
    }

    /// Human label
    pub fn label(&self) -> &'static str {
        match self {
            TransactionKind::Give => "Admin give",
            TransactionKind::Take => "Admin take",
            TransactionKind::Set => "Admin set",
            TransactionKind::Reset => "Admin reset",
            TransactionKind::Pay => "Player transfer",
            TransactionKind::Earn => "Earnings",
            TransactionKind::Spend => "Spending",
        }
    }

    /// Classify a deposit by its reason prefix. `None` means the caller is
    /// one leg of a transfer and must not be logged separately.
    pub fn for_deposit(reason: &str) -> Option<Self> {
        if reason.starts_with("Transfer") {
            None
        } else if reason.starts_with("Admin") {
            Some(TransactionKind::Give)
        } else {
            Some(TransactionKind::Earn)
        }
    }

    /// Classify a withdrawal by its reason prefix
    pub fn for_withdraw(reason: &str) -> Option<Self> {
        if reason.starts_with("Transfer") {
            None
        } else if reason.starts_with("Admin") {
            Some(TransactionKind::Take)
        } else {
            Some(TransactionKind::Spend)
        }
    }

    /// Classify an overwrite
    pub fn for_set(reason: &str) -> Self {
        if reason.to_ascii_lowercase().contains("reset") {
            TransactionKind::Reset
        } else {
            TransactionKind::Set
        }
    }
}

impl FromStr for TransactionKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "GIVE" => Ok(TransactionKind::Give),
            "TAKE" => Ok(TransactionKind::Take),
            "SET" => Ok(TransactionKind::Set),
            "RESET" => Ok(TransactionKind::Reset),
            "PAY" => Ok(TransactionKind::Pay),
            "EARN" => Ok(TransactionKind::Earn),
            "SPEND" => Ok(TransactionKind::Spend),
            other => Err(crate::Error::Storage(format!(
                "Unknown transaction kind '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Immutable record of one committed ledger mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEntry {
    /// Commit time
    pub timestamp: DateTime<Utc>,

    /// Event kind
    pub kind: TransactionKind,

    /// Account that was mutated (sender for transfers)
    pub source: AccountId,

    /// Recipient, transfers only
    pub target: Option<AccountId>,

    /// Amount moved or, for set/reset, the resulting balance
    pub amount: Decimal,

    /// Display name(s) at commit time
    pub display_name: String,
}

impl TransactionEntry {
    /// Single-account entry
    pub fn single(
        kind: TransactionKind,
        account: AccountId,
        display_name: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            source: account,
            target: None,
            amount,
            display_name: display_name.into(),
        }
    }

    /// Transfer entry naming both parties
    pub fn transfer(
        from: AccountId,
        from_name: &str,
        to: AccountId,
        to_name: &str,
        amount: Decimal,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: TransactionKind::Pay,
            source: from,
            target: Some(to),
            amount,
            display_name: format!("{} \u{2192} {}", from_name, to_name),
        }
    }

    /// Whether `account` is the source or target
    pub fn involves(&self, account: AccountId) -> bool {
        self.source == account || self.target == Some(account)
    }

    /// One-line dashboard rendering, e.g. `[14:05] Earnings: alice +$50`
    pub fn display_string(&self) -> String {
        format!(
            "[{}] {}: {} {}",
            self.timestamp.format("%H:%M"),
            self.kind.label(),
            self.display_name,
            self.formatted_amount()
        )
    }

    fn formatted_amount(&self) -> String {
        let amount = self.amount.round_dp(0);
        match self.kind {
            TransactionKind::Take | TransactionKind::Spend => format!("-${}", amount),
            TransactionKind::Set | TransactionKind::Reset => format!("=${}", amount),
            _ => format!("+${}", amount),
        }
    }
}

/// Outcome of a deposit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepositResult {
    /// Balance credited
    Success,
    /// Amount was zero or negative
    InvalidAmount,
    /// Balance would cross the configured ceiling
    ExceedsMaxBalance,
    /// A balance hook vetoed the change
    EventCancelled,
    /// The account could not be loaded
    AccountNotFound,
}

impl DepositResult {
    /// Whether the deposit was applied
    pub fn is_success(&self) -> bool {
        matches!(self, DepositResult::Success)
    }
}

/// Outcome of a withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WithdrawResult {
    /// Balance debited
    Success,
    /// Amount was zero or negative
    InvalidAmount,
    /// Balance does not cover the amount
    InsufficientFunds,
    /// A balance hook vetoed the change
    EventCancelled,
    /// The account could not be loaded
    AccountNotFound,
}

impl WithdrawResult {
    /// Whether the withdrawal was applied
    pub fn is_success(&self) -> bool {
        matches!(self, WithdrawResult::Success)
    }
}

/// Outcome of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferResult {
    /// Both legs applied
    Success,
    /// Sender cannot cover amount plus fee
    InsufficientFunds,
    /// Sender and recipient are the same account
    SelfTransfer,
    /// Amount was zero or negative
    InvalidAmount,
    /// Recipient would cross the configured ceiling
    RecipientMaxBalance,
    /// One of the accounts could not be loaded
    AccountUnavailable,
}

impl TransferResult {
    /// Whether the transfer was applied
    pub fn is_success(&self) -> bool {
        matches!(self, TransferResult::Success)
    }

    /// Label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferResult::Success => "success",
            TransferResult::InsufficientFunds => "insufficient_funds",
            TransferResult::SelfTransfer => "self_transfer",
            TransferResult::InvalidAmount => "invalid_amount",
            TransferResult::RecipientMaxBalance => "recipient_max_balance",
            TransferResult::AccountUnavailable => "account_unavailable",
        }
    }
}

/// Backend-side ranking row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopBalanceEntry {
    /// Account identifier
    pub id: AccountId,
    /// Indexed display name, if known
    pub name: Option<String>,
    /// Current durable balance
    pub balance: Decimal,
    /// Change since the reference snapshot (zero for all-time rankings)
    pub trend: Decimal,
}

/// Pushed to subscribers after every committed mutation
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceNotification {
    /// Account whose balance changed
    pub account: AccountId,
    /// Balance after the change
    pub new_balance: Decimal,
    /// Signed change
    pub delta: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name() {
        let id: AccountId = "0f8fad5b-d9cb-469f-a165-70867728950e".parse().unwrap();
        assert_eq!(id.short_name(), "0f8fad5b...");
    }

    #[test]
    fn test_record_credit_debit() {
        let mut record = AccountRecord::new(AccountId::random());
        record.credit(Decimal::new(50, 0), "Earn");
        record.debit(Decimal::new(20, 0), "Spend");

        assert_eq!(record.balance, Decimal::new(30, 0));
        assert_eq!(record.total_earned, Decimal::new(50, 0));
        assert_eq!(record.total_spent, Decimal::new(20, 0));
        assert!(record.last_transaction.starts_with("-20"));
        assert!(record.last_transaction_at.is_some());
    }

    #[test]
    fn test_overwrite_clamps_at_zero() {
        let mut record = AccountRecord::new(AccountId::random());
        record.overwrite(Decimal::new(-5, 0), "Admin set");
        assert_eq!(record.balance, Decimal::ZERO);
        assert_eq!(record.total_earned, Decimal::ZERO);
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(TransactionKind::for_deposit("Admin grant"), Some(TransactionKind::Give));
        assert_eq!(TransactionKind::for_deposit("Quest reward"), Some(TransactionKind::Earn));
        assert_eq!(TransactionKind::for_deposit("Transfer from x"), None);
        assert_eq!(TransactionKind::for_withdraw("Admin fine"), Some(TransactionKind::Take));
        assert_eq!(TransactionKind::for_withdraw("Shop"), Some(TransactionKind::Spend));
        assert_eq!(TransactionKind::for_set("Admin Reset"), TransactionKind::Reset);
        assert_eq!(TransactionKind::for_set("Admin set"), TransactionKind::Set);
    }

    #[test]
    fn test_kind_code_round_trip() {
        for kind in [
            TransactionKind::Give,
            TransactionKind::Take,
            TransactionKind::Set,
            TransactionKind::Reset,
            TransactionKind::Pay,
            TransactionKind::Earn,
            TransactionKind::Spend,
        ] {
            assert_eq!(kind.code().parse::<TransactionKind>().unwrap(), kind);
        }
        assert!("MINT".parse::<TransactionKind>().is_err());
    }

    #[test]
    fn test_entry_involves() {
        let a = AccountId::random();
        let b = AccountId::random();
        let c = AccountId::random();
        let entry = TransactionEntry::transfer(a, "alice", b, "bob", Decimal::ONE);

        assert!(entry.involves(a));
        assert!(entry.involves(b));
        assert!(!entry.involves(c));
        assert_eq!(entry.display_name, "alice \u{2192} bob");
    }

    #[test]
    fn test_display_string_sign() {
        let id = AccountId::random();
        let spend = TransactionEntry::single(TransactionKind::Spend, id, "alice", Decimal::new(12, 0));
        assert!(spend.display_string().ends_with("Spending: alice -$12"));

        let set = TransactionEntry::single(TransactionKind::Set, id, "alice", Decimal::new(40, 0));
        assert!(set.display_string().ends_with("=$40"));
    }
}
