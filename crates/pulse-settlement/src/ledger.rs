//! Per-validator reward ledger
//!
//! Each account sits behind its own mutex, so balance mutations for one
//! validator are serialized without blocking any other validator. The outer
//! map lock is only held to look up or insert accounts.
//!
//! Invariant: for every validator,
//! `pending + sum(open intent amounts) == credited - paid`.

use chrono::{DateTime, Utc};
use pulse_core::{Amount, PayoutReceipt, ValidatorId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{LedgerError, PayoutError};
use crate::journal::{Journal, JournalEntry};

/// A validator's ledger account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub validator_id: ValidatorId,
    pub payout_address: String,
    pub pending: Amount,
}

/// Durable record of a payout in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutIntent {
    pub idempotency_key: String,
    pub validator_id: ValidatorId,
    pub payout_address: String,
    pub amount: Amount,
    pub started_at: DateTime<Utc>,
}

/// Reward ledger, optionally backed by a journal
pub struct Ledger {
    accounts: RwLock<HashMap<ValidatorId, Arc<Mutex<Account>>>>,
    journal: Option<Journal>,
    open_intents: Mutex<HashMap<String, PayoutIntent>>,
    /// Keys of intents that were already open when the journal was replayed
    orphaned: Mutex<Vec<String>>,
    receipts: Mutex<Vec<PayoutReceipt>>,
}

impl Ledger {
    /// Ledger without durability, for tests and throwaway runs
    pub fn in_memory() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            journal: None,
            open_intents: Mutex::new(HashMap::new()),
            orphaned: Mutex::new(Vec::new()),
            receipts: Mutex::new(Vec::new()),
        }
    }

    /// Open a journaled ledger, replaying whatever is already on disk
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let (journal, entries) = Journal::open(path).await?;

        let mut accounts: HashMap<ValidatorId, Account> = HashMap::new();
        let mut intents: HashMap<String, PayoutIntent> = HashMap::new();
        let mut receipts = Vec::new();

        for entry in entries {
            apply(&mut accounts, &mut intents, &mut receipts, entry);
        }

        let orphaned: Vec<String> = intents.keys().cloned().collect();
        if !orphaned.is_empty() {
            warn!(
                "Journal has {} payout intent(s) without an outcome; reconciliation required",
                orphaned.len()
            );
        }
        info!(
            "Ledger replayed: {} accounts, {} receipts",
            accounts.len(),
            receipts.len()
        );

        Ok(Self {
            accounts: RwLock::new(
                accounts
                    .into_iter()
                    .map(|(id, account)| (id, Arc::new(Mutex::new(account))))
                    .collect(),
            ),
            journal: Some(journal),
            open_intents: Mutex::new(intents),
            orphaned: Mutex::new(orphaned),
            receipts: Mutex::new(receipts),
        })
    }

    async fn record(&self, entry: JournalEntry) -> Result<(), LedgerError> {
        match &self.journal {
            Some(journal) => journal.append(&entry).await,
            None => Ok(()),
        }
    }

    async fn account(&self, validator_id: &str) -> Option<Arc<Mutex<Account>>> {
        self.accounts.read().await.get(validator_id).cloned()
    }

    /// Open an account for a validator; a no-op if it already exists
    pub async fn open_account(
        &self,
        validator_id: &str,
        payout_address: &str,
    ) -> Result<(), LedgerError> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(validator_id) {
            return Ok(());
        }

        self.record(JournalEntry::AccountOpened {
            validator_id: validator_id.to_string(),
            payout_address: payout_address.to_string(),
        })
        .await?;

        accounts.insert(
            validator_id.to_string(),
            Arc::new(Mutex::new(Account {
                validator_id: validator_id.to_string(),
                payout_address: payout_address.to_string(),
                pending: 0,
            })),
        );
        debug!("Opened ledger account for {}", validator_id);
        Ok(())
    }

    /// Credit a reward, returning the new pending balance
    pub async fn credit(&self, validator_id: &str, amount: Amount) -> Result<Amount, LedgerError> {
        let account = self
            .account(validator_id)
            .await
            .ok_or_else(|| LedgerError::NotFound(validator_id.to_string()))?;
        let mut account = account.lock().await;

        self.record(JournalEntry::Credited {
            validator_id: validator_id.to_string(),
            amount,
        })
        .await?;

        account.pending = account.pending.saturating_add(amount);
        Ok(account.pending)
    }

    /// Pending balance for a validator, if the account exists
    pub async fn pending_amount(&self, validator_id: &str) -> Option<Amount> {
        let account = self.account(validator_id).await?;
        let pending = account.lock().await.pending;
        Some(pending)
    }

    /// Snapshot of every account
    pub async fn accounts(&self) -> Vec<Account> {
        let handles: Vec<Arc<Mutex<Account>>> =
            self.accounts.read().await.values().cloned().collect();
        let mut snapshot = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshot.push(handle.lock().await.clone());
        }
        snapshot.sort_by(|a, b| a.validator_id.cmp(&b.validator_id));
        snapshot
    }

    /// Step 1 of the payout saga: snapshot and zero the balance
    ///
    /// The read, the durable intent and the zeroing happen under the
    /// account's lock, so a concurrent payout for the same validator can only
    /// ever observe zero.
    pub async fn begin_payout(
        &self,
        validator_id: &str,
        idempotency_key: &str,
    ) -> Result<PayoutIntent, PayoutError> {
        let account = self
            .account(validator_id)
            .await
            .ok_or_else(|| PayoutError::NotFound(validator_id.to_string()))?;
        let mut account = account.lock().await;

        if account.pending == 0 {
            return Err(PayoutError::NoPendingAmount(validator_id.to_string()));
        }

        let intent = PayoutIntent {
            idempotency_key: idempotency_key.to_string(),
            validator_id: validator_id.to_string(),
            payout_address: account.payout_address.clone(),
            amount: account.pending,
            started_at: Utc::now(),
        };

        self.record(JournalEntry::PayoutStarted {
            intent: intent.clone(),
        })
        .await?;

        account.pending = 0;
        self.open_intents
            .lock()
            .await
            .insert(intent.idempotency_key.clone(), intent.clone());

        Ok(intent)
    }

    /// Success outcome: persist the receipt and close the intent
    pub async fn complete_payout(
        &self,
        intent: &PayoutIntent,
        transfer_reference: String,
    ) -> Result<PayoutReceipt, LedgerError> {
        let receipt = PayoutReceipt {
            validator_id: intent.validator_id.clone(),
            amount: intent.amount,
            transfer_reference,
            timestamp: Utc::now(),
        };

        self.record(JournalEntry::PayoutCompleted {
            idempotency_key: intent.idempotency_key.clone(),
            receipt: receipt.clone(),
        })
        .await?;

        self.close_intent(&intent.idempotency_key).await;
        self.receipts.lock().await.push(receipt.clone());
        Ok(receipt)
    }

    /// Failure outcome: restore the amount and close the intent
    ///
    /// Adds the amount back rather than overwriting, so credits that landed
    /// while the transfer was in flight are kept. Returns the new balance.
    pub async fn revert_payout(
        &self,
        intent: &PayoutIntent,
        reason: &str,
    ) -> Result<Amount, LedgerError> {
        let account = self
            .account(&intent.validator_id)
            .await
            .ok_or_else(|| LedgerError::NotFound(intent.validator_id.clone()))?;
        let mut account = account.lock().await;

        self.record(JournalEntry::PayoutReverted {
            idempotency_key: intent.idempotency_key.clone(),
            validator_id: intent.validator_id.clone(),
            amount: intent.amount,
            reason: reason.to_string(),
        })
        .await?;

        account.pending = account.pending.saturating_add(intent.amount);
        drop(account);

        self.close_intent(&intent.idempotency_key).await;
        Ok(self.pending_amount(&intent.validator_id).await.unwrap_or(0))
    }

    async fn close_intent(&self, idempotency_key: &str) {
        self.open_intents.lock().await.remove(idempotency_key);
        self.orphaned
            .lock()
            .await
            .retain(|key| key != idempotency_key);
    }

    /// Intents currently between `PayoutStarted` and an outcome
    pub async fn open_intents(&self) -> Vec<PayoutIntent> {
        self.open_intents.lock().await.values().cloned().collect()
    }

    /// Intents that were already open when the journal was replayed
    pub async fn orphaned_intents(&self) -> Vec<PayoutIntent> {
        let keys = self.orphaned.lock().await.clone();
        let intents = self.open_intents.lock().await;
        keys.iter()
            .filter_map(|key| intents.get(key).cloned())
            .collect()
    }

    /// Receipts for one validator, oldest first
    pub async fn receipts(&self, validator_id: &str) -> Vec<PayoutReceipt> {
        self.receipts
            .lock()
            .await
            .iter()
            .filter(|r| r.validator_id == validator_id)
            .cloned()
            .collect()
    }
}

fn apply(
    accounts: &mut HashMap<ValidatorId, Account>,
    intents: &mut HashMap<String, PayoutIntent>,
    receipts: &mut Vec<PayoutReceipt>,
    entry: JournalEntry,
) {
    match entry {
        JournalEntry::AccountOpened {
            validator_id,
            payout_address,
        } => {
            accounts.entry(validator_id.clone()).or_insert(Account {
                validator_id,
                payout_address,
                pending: 0,
            });
        }
        JournalEntry::Credited {
            validator_id,
            amount,
        } => match accounts.get_mut(&validator_id) {
            Some(account) => account.pending = account.pending.saturating_add(amount),
            None => warn!("Journal credit for unknown account {}", validator_id),
        },
        JournalEntry::PayoutStarted { intent } => {
            if let Some(account) = accounts.get_mut(&intent.validator_id) {
                account.pending = account.pending.saturating_sub(intent.amount);
            }
            intents.insert(intent.idempotency_key.clone(), intent);
        }
        JournalEntry::PayoutCompleted {
            idempotency_key,
            receipt,
        } => {
            intents.remove(&idempotency_key);
            receipts.push(receipt);
        }
        JournalEntry::PayoutReverted {
            idempotency_key,
            validator_id,
            amount,
            ..
        } => {
            intents.remove(&idempotency_key);
            if let Some(account) = accounts.get_mut(&validator_id) {
                account.pending = account.pending.saturating_add(amount);
            }
        }
    }
}
