//! Payout saga
//!
//! Drives a payout from the ledger snapshot through the external transfer to
//! exactly one durable outcome, and settles intents a crash left open.

use pulse_core::config::SettlementConfig;
use pulse_core::{Amount, PayoutReceipt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{PayoutError, TransferError};
use crate::ledger::{Ledger, PayoutIntent};
use crate::transfer::{backend_from_config, TransferBackend, TransferRequest};

/// Timeouts and retries for the external transfer
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    /// Ceiling for each backend call
    pub timeout: Duration,
    /// Transfer attempts per payout, all with the same idempotency key
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl TransferPolicy {
    pub fn from_config(config: &SettlementConfig) -> Self {
        Self {
            timeout: config.transfer_timeout(),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self::from_config(&SettlementConfig::default())
    }
}

/// Outcome of startup reconciliation
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Intents the backend had paid; receipts now recorded
    pub completed: Vec<PayoutReceipt>,
    /// Intents the backend never paid; amounts restored
    pub reverted: Vec<PayoutIntent>,
    /// Intents that could not be settled, with the reason
    pub unresolved: Vec<(PayoutIntent, String)>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

enum TransferOutcome {
    Paid(String),
    Failed { error: TransferError, attempted: bool },
}

/// Runs payouts against a ledger and a transfer backend
pub struct SettlementEngine {
    ledger: Arc<Ledger>,
    backend: Arc<dyn TransferBackend>,
    policy: TransferPolicy,
    breaker: CircuitBreaker,
}

impl SettlementEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        backend: Arc<dyn TransferBackend>,
        policy: TransferPolicy,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            ledger,
            backend,
            policy,
            breaker,
        }
    }

    pub fn from_config(
        config: &SettlementConfig,
        ledger: Arc<Ledger>,
    ) -> Result<Self, TransferError> {
        let backend = backend_from_config(&config.backend, config.transfer_timeout())?;
        Ok(Self::new(
            ledger,
            backend,
            TransferPolicy::from_config(config),
            CircuitBreaker::new(config.circuit_threshold, config.circuit_timeout_secs),
        ))
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Pay a validator its entire pending balance
    ///
    /// On return the ledger reflects exactly one outcome: a receipt, or the
    /// amount restored. `LedgerInconsistency` is the only exception and is
    /// logged at ERROR for an operator.
    pub async fn payout(&self, validator_id: &str) -> Result<PayoutReceipt, PayoutError> {
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let intent = self.ledger.begin_payout(validator_id, &idempotency_key).await?;

        info!(
            "Payout {} started: {} to validator {}",
            intent.idempotency_key, intent.amount, intent.validator_id
        );

        let outcome = self.execute_transfer(&intent).await;
        self.settle(&intent, outcome).await
    }

    /// Funds available to the payer
    pub async fn payer_balance(&self) -> Result<Amount, TransferError> {
        self.with_timeout(self.backend.balance()).await
    }

    /// Settle every intent that was open when the journal was replayed
    ///
    /// Intents are not retried: the backend is asked whether the key was
    /// paid, and the ledger is brought in line with the answer.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for intent in self.ledger.orphaned_intents().await {
            let found = self
                .with_timeout(self.backend.find_transfer(&intent.idempotency_key))
                .await;

            match found {
                Ok(Some(reference)) => {
                    match self.ledger.complete_payout(&intent, reference).await {
                        Ok(receipt) => {
                            info!(
                                "Reconciled payout {} as completed",
                                intent.idempotency_key
                            );
                            report.completed.push(receipt);
                        }
                        Err(e) => report.unresolved.push((intent, e.to_string())),
                    }
                }
                Ok(None) => {
                    match self
                        .ledger
                        .revert_payout(&intent, "no transfer found during reconciliation")
                        .await
                    {
                        Ok(_) => {
                            info!("Reconciled payout {} as reverted", intent.idempotency_key);
                            report.reverted.push(intent);
                        }
                        Err(e) => report.unresolved.push((intent, e.to_string())),
                    }
                }
                Err(e) => {
                    warn!(
                        "Could not reconcile payout {}: {}",
                        intent.idempotency_key, e
                    );
                    report.unresolved.push((intent, e.to_string()));
                }
            }
        }

        report
    }

    async fn with_timeout<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        match tokio::time::timeout(self.policy.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(format!(
                "no answer within {}ms",
                self.policy.timeout.as_millis()
            ))),
        }
    }

    /// Feed a backend call to the circuit: only transport failures count
    fn observe<T>(&self, result: &Result<T, TransferError>) {
        match result {
            Err(TransferError::Timeout(_) | TransferError::Network(_)) => {
                self.breaker.record_failure()
            }
            _ => self.breaker.record_success(),
        }
    }

    async fn execute_transfer(&self, intent: &PayoutIntent) -> TransferOutcome {
        if let Err(retry_in_ms) = self.breaker.try_acquire() {
            return TransferOutcome::Failed {
                error: TransferError::CircuitOpen { retry_in_ms },
                attempted: false,
            };
        }

        let balance = self.payer_balance().await;
        self.observe(&balance);
        match balance {
            Ok(available) if available < intent.amount => {
                return TransferOutcome::Failed {
                    error: TransferError::InsufficientFunds {
                        available,
                        required: intent.amount,
                    },
                    attempted: false,
                };
            }
            Ok(_) => {}
            Err(e) => {
                return TransferOutcome::Failed {
                    error: e,
                    attempted: false,
                };
            }
        }

        let request = TransferRequest {
            idempotency_key: intent.idempotency_key.clone(),
            to: intent.payout_address.clone(),
            amount: intent.amount,
        };

        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            let result = self.with_timeout(self.backend.transfer(&request)).await;
            self.observe(&result);
            match result {
                Ok(reference) => return TransferOutcome::Paid(reference),
                Err(e) if e.is_transient() => {
                    if attempt >= self.policy.max_attempts {
                        break e;
                    }
                    warn!(
                        "Transfer {} failed ({}). Retrying {}/{} in {:?}",
                        intent.idempotency_key,
                        e,
                        attempt + 1,
                        self.policy.max_attempts,
                        self.policy.retry_backoff
                    );
                    tokio::time::sleep(self.policy.retry_backoff).await;
                }
                Err(e) => {
                    return TransferOutcome::Failed {
                        error: e,
                        attempted: true,
                    };
                }
            }
        };

        // A transport failure or unreadable reply says nothing about whether funds moved
        match self
            .with_timeout(self.backend.find_transfer(&intent.idempotency_key))
            .await
        {
            Ok(Some(reference)) => {
                warn!(
                    "Transfer {} reported {} but was applied as {}",
                    intent.idempotency_key, last_error, reference
                );
                TransferOutcome::Paid(reference)
            }
            Ok(None) => TransferOutcome::Failed {
                error: last_error,
                attempted: true,
            },
            Err(lookup_error) => {
                warn!(
                    "Lookup of transfer {} failed ({}); treating as not paid",
                    intent.idempotency_key, lookup_error
                );
                TransferOutcome::Failed {
                    error: last_error,
                    attempted: true,
                }
            }
        }
    }

    async fn settle(
        &self,
        intent: &PayoutIntent,
        outcome: TransferOutcome,
    ) -> Result<PayoutReceipt, PayoutError> {
        match outcome {
            TransferOutcome::Paid(reference) => {
                match self.ledger.complete_payout(intent, reference.clone()).await {
                    Ok(receipt) => {
                        info!(
                            "Payout {} completed: {} to validator {} ({})",
                            intent.idempotency_key,
                            receipt.amount,
                            receipt.validator_id,
                            receipt.transfer_reference
                        );
                        Ok(receipt)
                    }
                    Err(e) => {
                        error!(
                            "Transfer {} succeeded as {} but the receipt could not be recorded: {}",
                            intent.idempotency_key, reference, e
                        );
                        Err(PayoutError::LedgerInconsistency {
                            idempotency_key: intent.idempotency_key.clone(),
                            detail: format!(
                                "transfer {} succeeded, receipt not recorded: {}",
                                reference, e
                            ),
                        })
                    }
                }
            }
            TransferOutcome::Failed { error, attempted } => {
                let reason = error.to_string();
                match self.ledger.revert_payout(intent, &reason).await {
                    Ok(restored) => {
                        warn!(
                            "Payout {} failed: {}. Pending balance restored to {}",
                            intent.idempotency_key, reason, restored
                        );
                        Err(PayoutError::TransferFailed {
                            validator_id: intent.validator_id.clone(),
                            amount: intent.amount,
                            reason,
                            attempted,
                        })
                    }
                    Err(e) => {
                        error!(
                            "Payout {} failed ({}) and {} could not be restored: {}",
                            intent.idempotency_key, reason, intent.amount, e
                        );
                        Err(PayoutError::LedgerInconsistency {
                            idempotency_key: intent.idempotency_key.clone(),
                            detail: format!("transfer failed, revert not recorded: {}", e),
                        })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::SimulatedTransfer;
    use pulse_core::Signer;

    fn policy() -> TransferPolicy {
        TransferPolicy {
            timeout: Duration::from_millis(500),
            max_attempts: 1,
            retry_backoff: Duration::from_millis(10),
        }
    }

    async fn setup(
        payer_balance: Amount,
        pending: Amount,
        policy: TransferPolicy,
    ) -> (SettlementEngine, Arc<SimulatedTransfer>) {
        let ledger = Arc::new(Ledger::in_memory());
        ledger
            .open_account("v-1", &Signer::generate().public_key())
            .await
            .unwrap();
        if pending > 0 {
            ledger.credit("v-1", pending).await.unwrap();
        }
        let backend = Arc::new(SimulatedTransfer::new(payer_balance));
        let engine = SettlementEngine::new(
            ledger,
            backend.clone(),
            policy,
            CircuitBreaker::new(3, 60),
        );
        (engine, backend)
    }

    #[tokio::test]
    async fn test_successful_payout_then_nothing_pending() {
        let (engine, backend) = setup(1000, 500, policy()).await;

        let receipt = engine.payout("v-1").await.unwrap();
        assert_eq!(receipt.amount, 500);
        assert_eq!(receipt.validator_id, "v-1");
        assert_eq!(engine.ledger().pending_amount("v-1").await, Some(0));
        assert_eq!(backend.balance().await.unwrap(), 500);

        assert!(matches!(
            engine.payout("v-1").await,
            Err(PayoutError::NoPendingAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_insufficient_funds_restores_balance() {
        let (engine, backend) = setup(100, 500, policy()).await;

        let err = engine.payout("v-1").await.unwrap_err();
        match &err {
            PayoutError::TransferFailed {
                amount, attempted, ..
            } => {
                assert_eq!(*amount, 500);
                assert!(!attempted);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!err.money_may_have_moved());
        assert_eq!(engine.ledger().pending_amount("v-1").await, Some(500));
        assert_eq!(backend.transfer_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_validator() {
        let (engine, _) = setup(1000, 0, policy()).await;
        assert!(matches!(
            engine.payout("ghost").await,
            Err(PayoutError::NotFound(_))
        ));
        assert!(matches!(
            engine.payout("v-1").await,
            Err(PayoutError::NoPendingAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_transfer_is_reverted() {
        let (engine, backend) = setup(1000, 500, policy()).await;
        backend
            .inject_failure(TransferError::Rejected("account frozen".into()))
            .await;

        let err = engine.payout("v-1").await.unwrap_err();
        assert_eq!(err.kind(), "TransferFailed");
        assert_eq!(engine.ledger().pending_amount("v-1").await, Some(500));
        assert!(engine.ledger().open_intents().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_with_same_key() {
        let mut retrying = policy();
        retrying.max_attempts = 3;
        let (engine, backend) = setup(1000, 500, retrying).await;
        backend
            .inject_failure(TransferError::Network("connection reset".into()))
            .await;

        let receipt = engine.payout("v-1").await.unwrap();
        assert_eq!(receipt.amount, 500);
        assert_eq!(backend.transfer_count().await, 1);
        assert_eq!(engine.breaker().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_transfer_that_never_landed_is_reverted() {
        let ledger = Arc::new(Ledger::in_memory());
        ledger
            .open_account("v-1", &Signer::generate().public_key())
            .await
            .unwrap();
        ledger.credit("v-1", 500).await.unwrap();
        let backend =
            Arc::new(SimulatedTransfer::new(1000).with_delay(Duration::from_secs(2)));
        let engine = SettlementEngine::new(
            ledger.clone(),
            backend.clone(),
            TransferPolicy {
                timeout: Duration::from_millis(100),
                max_attempts: 1,
                retry_backoff: Duration::from_millis(10),
            },
            CircuitBreaker::new(3, 60),
        );

        let err = engine.payout("v-1").await.unwrap_err();
        assert!(err.money_may_have_moved());
        assert_eq!(ledger.pending_amount("v-1").await, Some(500));
        assert_eq!(backend.transfer_count().await, 0);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let (engine, backend) = setup(1000, 500, policy()).await;
        for _ in 0..3 {
            engine.breaker().record_failure();
        }

        let err = engine.payout("v-1").await.unwrap_err();
        assert!(!err.money_may_have_moved());
        assert_eq!(engine.ledger().pending_amount("v-1").await, Some(500));
        assert_eq!(backend.transfer_count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_payouts_pay_once() {
        let (engine, backend) = setup(10_000, 500, policy()).await;
        let engine = Arc::new(engine);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.payout("v-1").await })
            })
            .collect();

        let mut paid = 0;
        let mut nothing_pending = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(receipt) => {
                    assert_eq!(receipt.amount, 500);
                    paid += 1;
                }
                Err(PayoutError::NoPendingAmount(_)) => nothing_pending += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(paid, 1);
        assert_eq!(nothing_pending, 7);
        assert_eq!(backend.total_transferred().await, 500);
    }

    #[tokio::test]
    async fn test_credits_during_payout_are_preserved() {
        let (engine, _) = setup(10_000, 500, policy()).await;
        let engine = Arc::new(engine);

        let payout = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.payout("v-1").await })
        };
        for _ in 0..10 {
            engine.ledger().credit("v-1", 1).await.unwrap();
        }

        let paid = payout.await.unwrap().map(|r| r.amount).unwrap_or(0);
        let pending = engine.ledger().pending_amount("v-1").await.unwrap();
        assert_eq!(paid + pending, 510);
    }

    #[tokio::test]
    async fn test_reconcile_settles_orphans() {
        let (engine, backend) = setup(1000, 0, policy()).await;
        let ledger = engine.ledger().clone();

        // Nothing orphaned in a fresh ledger
        let report = engine.reconcile().await;
        assert!(report.is_clean());
        assert!(report.completed.is_empty() && report.reverted.is_empty());

        ledger.credit("v-1", 300).await.unwrap();
        let intent = ledger.begin_payout("v-1", "live").await.unwrap();
        backend
            .seed_transfer(
                TransferRequest {
                    idempotency_key: intent.idempotency_key.clone(),
                    to: intent.payout_address.clone(),
                    amount: intent.amount,
                },
                "sim-seeded",
            )
            .await;

        // Live intents are not orphans; reconciliation leaves them alone
        let report = engine.reconcile().await;
        assert!(report.completed.is_empty());
        assert_eq!(ledger.open_intents().await.len(), 1);
    }
}
