//! Validator registry keyed by public key
//!
//! The ledger account is the durable half of a validator's identity: the
//! registry is rebuilt from journaled accounts on startup, and a new
//! validator gets its account opened before it becomes visible here.

use pulse_core::{Validator, ValidatorId};
use pulse_settlement::{Account, Ledger, LedgerError};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// Identity fields the hub holds for a validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRecord {
    pub id: ValidatorId,
    pub public_key: String,
    pub ip: String,
    pub location: Option<String>,
}

impl ValidatorRecord {
    pub fn with_balance(&self, pending_reward_amount: u64) -> Validator {
        Validator {
            id: self.id.clone(),
            public_key: self.public_key.clone(),
            ip: self.ip.clone(),
            location: self.location.clone(),
            pending_reward_amount,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<ValidatorId, ValidatorRecord>,
    by_key: HashMap<String, ValidatorId>,
}

#[derive(Default)]
pub struct ValidatorRegistry {
    inner: RwLock<RegistryInner>,
}

impl ValidatorRegistry {
    /// Rebuild from ledger accounts; the payout address is the public key
    pub fn from_accounts(accounts: Vec<Account>) -> Self {
        let mut inner = RegistryInner::default();
        for account in accounts {
            inner
                .by_key
                .insert(account.payout_address.clone(), account.validator_id.clone());
            inner.by_id.insert(
                account.validator_id.clone(),
                ValidatorRecord {
                    id: account.validator_id,
                    public_key: account.payout_address,
                    ip: String::new(),
                    location: None,
                },
            );
        }
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Find the validator for `public_key`, creating it on first signup
    ///
    /// Holds the write lock across account creation so two concurrent
    /// signups with the same key resolve to one identity. Returns the record
    /// and whether it was created.
    pub async fn lookup_or_create(
        &self,
        ledger: &Ledger,
        public_key: &str,
        ip: &str,
        location: Option<String>,
    ) -> Result<(ValidatorRecord, bool), LedgerError> {
        let mut inner = self.inner.write().await;

        if let Some(id) = inner.by_key.get(public_key).cloned() {
            if let Some(record) = inner.by_id.get_mut(&id) {
                record.ip = ip.to_string();
                if location.is_some() {
                    record.location = location;
                }
                return Ok((record.clone(), false));
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        ledger.open_account(&id, public_key).await?;

        let record = ValidatorRecord {
            id: id.clone(),
            public_key: public_key.to_string(),
            ip: ip.to_string(),
            location,
        };
        inner.by_key.insert(public_key.to_string(), id.clone());
        inner.by_id.insert(id.clone(), record.clone());
        info!("Registered new validator {}", id);

        Ok((record, true))
    }

    pub async fn get(&self, id: &str) -> Option<ValidatorRecord> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<ValidatorRecord> {
        let mut records: Vec<_> = self.inner.read().await.by_id.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }
}
