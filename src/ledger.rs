//! Team cash and holdings.
//!
//! The engine only talks to the [`Ledger`] trait. A [`LedgerTransaction`] works on a
//! private copy of one team's book. `commit` publishes it, dropping it discards it.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::{AssetId, Quote, TeamId, Timestamp};

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create the team's book with `initial_cash`. A second call is a no-op.
    async fn open_account(&self, team_id: TeamId, initial_cash: Quote) -> Result<(), LedgerError>;

    async fn begin(&self, team_id: TeamId) -> Result<Box<dyn LedgerTransaction>, LedgerError>;

    async fn balance(&self, team_id: TeamId) -> Result<Quote, LedgerError>;

    async fn holdings(&self, team_id: TeamId, asset_id: AssetId) -> Result<Decimal, LedgerError>;
}

#[async_trait]
pub trait LedgerTransaction: Send {
    fn balance(&self) -> Quote;

    fn holdings(&self, asset_id: AssetId) -> Decimal;

    /// Fails rather than letting cash go negative.
    fn debit(&mut self, amount: Quote) -> Result<(), LedgerError>;

    fn credit(&mut self, amount: Quote);

    /// Holdings may go negative. whether that is allowed is the caller's call.
    fn adjust_holdings(&mut self, asset_id: AssetId, delta: Decimal);

    async fn commit(self: Box<Self>) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("no ledger account for team {0}")]
    UnknownAccount(TeamId),

    #[error("insufficient cash: required {required}, available {available}")]
    InsufficientCash { required: Quote, available: Quote },

    #[error("book of team {0} changed underneath the transaction")]
    Conflict(TeamId),

    #[error("ledger unavailable: {reason}")]
    Unavailable { reason: String },
}

/// One team's cash and units per asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamBook {
    pub team_id: TeamId,
    pub balance: Quote,
    pub holdings: HashMap<AssetId, Decimal>,
    pub total_deposited: Quote,
    pub created_at: Timestamp,
    version: u64,
}

impl TeamBook {
    pub fn new(team_id: TeamId, initial_cash: Quote, timestamp: Timestamp) -> Self {
        Self {
            team_id,
            balance: initial_cash,
            holdings: HashMap::new(),
            total_deposited: initial_cash,
            created_at: timestamp,
            version: 0,
        }
    }

    pub fn holding(&self, asset_id: AssetId) -> Decimal {
        self.holdings.get(&asset_id).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn debit(&mut self, amount: Quote) -> Result<(), LedgerError> {
        if amount > self.balance {
            return Err(LedgerError::InsufficientCash {
                required: amount,
                available: self.balance,
            });
        }
        self.balance = self.balance.sub(amount);
        Ok(())
    }

    pub fn credit(&mut self, amount: Quote) {
        self.balance = self.balance.add(amount);
    }

    pub fn adjust_holdings(&mut self, asset_id: AssetId, delta: Decimal) {
        let entry = self.holdings.entry(asset_id).or_insert(Decimal::ZERO);
        *entry += delta;
        if entry.is_zero() {
            self.holdings.remove(&asset_id);
        }
    }
}

type Books = Arc<Mutex<HashMap<TeamId, TeamBook>>>;

fn lock(books: &Books) -> MutexGuard<'_, HashMap<TeamId, TeamBook>> {
    books.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-local ledger. Optimistic: a commit fails if the book moved since `begin`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    books: Books,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail with `Unavailable`. Used to exercise rollback paths.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn book(&self, team_id: TeamId) -> Option<TeamBook> {
        lock(&self.books).get(&team_id).cloned()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn open_account(&self, team_id: TeamId, initial_cash: Quote) -> Result<(), LedgerError> {
        lock(&self.books)
            .entry(team_id)
            .or_insert_with(|| TeamBook::new(team_id, initial_cash, Timestamp::now()));
        Ok(())
    }

    async fn begin(&self, team_id: TeamId) -> Result<Box<dyn LedgerTransaction>, LedgerError> {
        let book = lock(&self.books)
            .get(&team_id)
            .cloned()
            .ok_or(LedgerError::UnknownAccount(team_id))?;
        Ok(Box::new(InMemoryTransaction {
            base_version: book.version,
            book,
            books: Arc::clone(&self.books),
            fail: Arc::clone(&self.fail_next_commit),
        }))
    }

    async fn balance(&self, team_id: TeamId) -> Result<Quote, LedgerError> {
        lock(&self.books)
            .get(&team_id)
            .map(|book| book.balance)
            .ok_or(LedgerError::UnknownAccount(team_id))
    }

    async fn holdings(&self, team_id: TeamId, asset_id: AssetId) -> Result<Decimal, LedgerError> {
        lock(&self.books)
            .get(&team_id)
            .map(|book| book.holding(asset_id))
            .ok_or(LedgerError::UnknownAccount(team_id))
    }
}

struct InMemoryTransaction {
    book: TeamBook,
    base_version: u64,
    books: Books,
    fail: Arc<AtomicBool>,
}

#[async_trait]
impl LedgerTransaction for InMemoryTransaction {
    fn balance(&self) -> Quote {
        self.book.balance
    }

    fn holdings(&self, asset_id: AssetId) -> Decimal {
        self.book.holding(asset_id)
    }

    fn debit(&mut self, amount: Quote) -> Result<(), LedgerError> {
        self.book.debit(amount)
    }

    fn credit(&mut self, amount: Quote) {
        self.book.credit(amount);
    }

    fn adjust_holdings(&mut self, asset_id: AssetId, delta: Decimal) {
        self.book.adjust_holdings(asset_id, delta);
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        let InMemoryTransaction {
            mut book,
            base_version,
            books,
            fail,
        } = *self;
        if fail.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Unavailable {
                reason: "injected commit failure".to_string(),
            });
        }

        let mut guard = lock(&books);
        let team_id = book.team_id;
        let current = guard.get_mut(&team_id).ok_or(LedgerError::UnknownAccount(team_id))?;
        if current.version != base_version {
            return Err(LedgerError::Conflict(team_id));
        }

        book.version = base_version + 1;
        *current = book;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn funded(cash: Decimal) -> (InMemoryLedger, TeamId) {
        let ledger = InMemoryLedger::new();
        let team = TeamId::new();
        ledger.open_account(team, Quote::new(cash)).await.unwrap();
        (ledger, team)
    }

    #[tokio::test]
    async fn open_account_is_idempotent() {
        let (ledger, team) = funded(dec!(1000)).await;
        ledger.open_account(team, Quote::new(dec!(5))).await.unwrap();
        assert_eq!(ledger.balance(team).await.unwrap().value(), dec!(1000));
    }

    #[tokio::test]
    async fn commit_applies_changes() {
        let (ledger, team) = funded(dec!(1000)).await;
        let asset = AssetId::new();

        let mut tx = ledger.begin(team).await.unwrap();
        tx.debit(Quote::new(dec!(250))).unwrap();
        tx.adjust_holdings(asset, dec!(25));
        tx.commit().await.unwrap();

        assert_eq!(ledger.balance(team).await.unwrap().value(), dec!(750));
        assert_eq!(ledger.holdings(team, asset).await.unwrap(), dec!(25));
        let book = ledger.book(team).unwrap();
        assert_eq!(book.total_deposited.value(), dec!(1000));
        assert_eq!(book.holdings.get(&asset), Some(&dec!(25)));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let (ledger, team) = funded(dec!(1000)).await;
        {
            let mut tx = ledger.begin(team).await.unwrap();
            tx.debit(Quote::new(dec!(999))).unwrap();
            tx.adjust_holdings(AssetId::new(), dec!(1));
        }
        assert_eq!(ledger.balance(team).await.unwrap().value(), dec!(1000));
    }

    #[tokio::test]
    async fn debit_never_goes_negative() {
        let (ledger, team) = funded(dec!(100)).await;
        let mut tx = ledger.begin(team).await.unwrap();
        let err = tx.debit(Quote::new(dec!(100.01))).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCash { .. }));
        assert_eq!(tx.balance().value(), dec!(100));
    }

    #[tokio::test]
    async fn stale_transaction_conflicts() {
        let (ledger, team) = funded(dec!(100)).await;
        let mut first = ledger.begin(team).await.unwrap();
        let mut second = ledger.begin(team).await.unwrap();
        first.credit(Quote::new(dec!(1)));
        second.credit(Quote::new(dec!(2)));

        first.commit().await.unwrap();
        assert_eq!(second.commit().await.unwrap_err(), LedgerError::Conflict(team));
        assert_eq!(ledger.balance(team).await.unwrap().value(), dec!(101));
    }

    #[tokio::test]
    async fn injected_failure_leaves_book_untouched() {
        let (ledger, team) = funded(dec!(100)).await;
        ledger.fail_next_commit();
        let mut tx = ledger.begin(team).await.unwrap();
        tx.credit(Quote::new(dec!(50)));
        assert!(matches!(tx.commit().await, Err(LedgerError::Unavailable { .. })));
        assert_eq!(ledger.balance(team).await.unwrap().value(), dec!(100));
    }

    #[test]
    fn short_holdings_and_cleanup() {
        let mut book = TeamBook::new(TeamId::new(), Quote::new(dec!(10)), Timestamp::from_millis(0));
        let asset = AssetId::new();
        book.adjust_holdings(asset, dec!(-5));
        assert_eq!(book.holding(asset), dec!(-5));
        book.adjust_holdings(asset, dec!(5));
        assert!(book.holdings.is_empty());
    }
}
