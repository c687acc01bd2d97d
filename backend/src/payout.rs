//! Payout channel: moves the prize to the winner.
//!
//! Transfers are keyed by the randomness request id that settled the round,
//! and a channel pays each request at most once. A retried delivery is
//! therefore safe even when the first attempt's outcome was unknown.
//!
//! Two implementations:
//!
//! - [`LedgerPayout`] credits an in-memory ledger. Recipients can be blocked
//!   to make transfers fail.
//! - [`RpcPayout`] signs a System Program transfer from the treasury keypair
//!   and submits it over JSON-RPC, with optional compute-budget instructions
//!   and exponential backoff on `BlockhashNotFound`. The last signature sent
//!   for a request is remembered and its status is checked before anything
//!   is re-sent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::{self, BoxFuture};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::{Transaction, TransactionError};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::PayoutError;

/// Outbound transfer of funds to a participant.
pub trait PayoutChannel: Send + Sync {
    /// Pay `amount` to `to` for the round settled by `request_id`. Repeated
    /// calls with the same `request_id` pay at most once.
    fn transfer(
        &self,
        request_id: u64,
        to: Pubkey,
        amount: u64,
    ) -> BoxFuture<'_, Result<(), PayoutError>>;
}

#[derive(Default)]
struct Ledger {
    balances: HashMap<Pubkey, u64>,
    blocked: HashSet<Pubkey>,
    /// Request ids already paid.
    paid: HashSet<u64>,
}

/// In-memory payout ledger.
#[derive(Default)]
pub struct LedgerPayout {
    ledger: Mutex<Ledger>,
}

impl LedgerPayout {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Total amount credited to `account`.
    pub fn balance_of(&self, account: &Pubkey) -> u64 {
        self.lock().balances.get(account).copied().unwrap_or(0)
    }

    /// Make every transfer to `account` fail until unblocked.
    pub fn block(&self, account: Pubkey) {
        self.lock().blocked.insert(account);
    }

    pub fn unblock(&self, account: &Pubkey) {
        self.lock().blocked.remove(account);
    }

    fn credit(&self, request_id: u64, to: Pubkey, amount: u64) -> Result<(), PayoutError> {
        let mut ledger = self.lock();
        if ledger.paid.contains(&request_id) {
            return Ok(());
        }
        if ledger.blocked.contains(&to) {
            return Err(PayoutError::Rejected(format!(
                "recipient {to} rejected the transfer"
            )));
        }
        let balance = ledger.balances.get(&to).copied().unwrap_or(0);
        let balance = balance
            .checked_add(amount)
            .ok_or_else(|| PayoutError::Rejected(format!("balance overflow crediting {to}")))?;
        ledger.balances.insert(to, balance);
        ledger.paid.insert(request_id);
        Ok(())
    }
}

impl PayoutChannel for LedgerPayout {
    fn transfer(
        &self,
        request_id: u64,
        to: Pubkey,
        amount: u64,
    ) -> BoxFuture<'_, Result<(), PayoutError>> {
        Box::pin(future::ready(self.credit(request_id, to, amount)))
    }
}

/// Compute Budget program id.
const COMPUTE_BUDGET_PROGRAM_ID: &str = "ComputeBudget111111111111111111111111111111";

/// System Program instruction index of `Transfer`.
const SYSTEM_TRANSFER_TAG: u32 = 2;

/// A payout transaction handed to the cluster.
#[derive(Debug, Clone, Copy)]
struct SubmittedTransfer {
    signature: Signature,
    blockhash: Hash,
}

/// Where a submitted transfer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferStatus {
    /// Executed successfully; the winner is paid.
    Landed,
    /// Executed with an error, or expired unprocessed; nothing was paid.
    Failed,
    /// Not seen yet and its blockhash is still valid; it may still land.
    Pending,
}

/// Classify a signature status. `blockhash_valid` must be sampled before
/// `status` so an expired blockhash plus an unknown signature proves the
/// transaction can no longer land.
fn classify_transfer(
    status: Option<Result<(), TransactionError>>,
    blockhash_valid: bool,
) -> TransferStatus {
    match status {
        Some(Ok(())) => TransferStatus::Landed,
        Some(Err(_)) => TransferStatus::Failed,
        None if blockhash_valid => TransferStatus::Pending,
        None => TransferStatus::Failed,
    }
}

/// Pays winners from a treasury keypair over JSON-RPC.
pub struct RpcPayout {
    rpc_client: Arc<RpcClient>,
    treasury: Arc<Keypair>,
    config: AppConfig,
    /// Last transaction sent per request id whose outcome is not settled.
    submitted: Mutex<HashMap<u64, SubmittedTransfer>>,
}

impl RpcPayout {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let treasury = config
            .treasury_keypair
            .clone()
            .context("rpc payout requires a treasury keypair")?;
        let rpc_client = Arc::new(RpcClient::new_with_commitment(
            config.rpc_url.clone(),
            CommitmentConfig::confirmed(),
        ));
        Ok(Self {
            rpc_client,
            treasury,
            config: config.clone(),
            submitted: Mutex::new(HashMap::new()),
        })
    }

    fn submissions(&self) -> MutexGuard<'_, HashMap<u64, SubmittedTransfer>> {
        self.submitted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a previously submitted transfer on the cluster.
    async fn transfer_status(
        &self,
        submitted: &SubmittedTransfer,
    ) -> Result<TransferStatus, PayoutError> {
        let blockhash_valid = self
            .rpc_client
            .is_blockhash_valid(&submitted.blockhash, CommitmentConfig::processed())
            .await
            .map_err(|e| PayoutError::Unconfirmed(format!("blockhash check failed: {e}")))?;
        let status = self
            .rpc_client
            .get_signature_status_with_commitment_and_history(
                &submitted.signature,
                CommitmentConfig::confirmed(),
                true,
            )
            .await
            .map_err(|e| PayoutError::Unconfirmed(format!("signature status query failed: {e}")))?;
        Ok(classify_transfer(status, blockhash_valid))
    }

    /// Send a transaction with exponential backoff on BlockhashNotFound.
    ///
    /// Errors carrying a transaction error mean nothing was paid. Any other
    /// send or confirmation error leaves the submission recorded and is
    /// reported as unconfirmed.
    async fn send_with_retries(
        &self,
        request_id: u64,
        instructions: &[Instruction],
    ) -> Result<Signature, PayoutError> {
        let mut retry_delay = Duration::from_millis(self.config.initial_retry_delay_ms);

        for attempt in 0..self.config.max_retries {
            let blockhash = self
                .rpc_client
                .get_latest_blockhash()
                .await
                .map_err(|e| PayoutError::Rejected(format!("failed to fetch latest blockhash: {e}")))?;

            let tx = Transaction::new_signed_with_payer(
                instructions,
                Some(&self.treasury.pubkey()),
                &[self.treasury.as_ref()],
                blockhash,
            );
            self.submissions().insert(
                request_id,
                SubmittedTransfer {
                    signature: tx.signatures[0],
                    blockhash,
                },
            );

            match self.rpc_client.send_and_confirm_transaction(&tx).await {
                Ok(sig) => return Ok(sig),
                Err(e)
                    if e.to_string().contains("BlockhashNotFound")
                        && attempt + 1 < self.config.max_retries =>
                {
                    warn!(
                        request_id,
                        attempt = attempt + 1,
                        delay = ?retry_delay,
                        "BlockhashNotFound, retrying payout"
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = retry_delay.saturating_mul(2).min(Duration::from_secs(60));
                }
                Err(e) if e.get_transaction_error().is_some() => {
                    self.submissions().remove(&request_id);
                    return Err(PayoutError::Rejected(format!(
                        "payout transaction failed: {e}"
                    )));
                }
                Err(e) => {
                    return Err(PayoutError::Unconfirmed(format!(
                        "payout {} not confirmed: {e}",
                        tx.signatures[0]
                    )));
                }
            }
        }

        Err(PayoutError::Rejected(format!(
            "max retries ({}) exceeded for payout",
            self.config.max_retries
        )))
    }
}

impl PayoutChannel for RpcPayout {
    fn transfer(
        &self,
        request_id: u64,
        to: Pubkey,
        amount: u64,
    ) -> BoxFuture<'_, Result<(), PayoutError>> {
        Box::pin(async move {
            let previous = self.submissions().get(&request_id).copied();
            if let Some(previous) = previous {
                match self.transfer_status(&previous).await? {
                    TransferStatus::Landed => {
                        self.submissions().remove(&request_id);
                        info!(
                            request_id,
                            signature = %previous.signature,
                            "Earlier payout landed, not re-sending"
                        );
                        return Ok(());
                    }
                    TransferStatus::Pending => {
                        return Err(PayoutError::Unconfirmed(format!(
                            "payout {} is still pending",
                            previous.signature
                        )));
                    }
                    TransferStatus::Failed => {
                        self.submissions().remove(&request_id);
                        warn!(
                            request_id,
                            signature = %previous.signature,
                            "Earlier payout did not land, re-sending"
                        );
                    }
                }
            }

            let instructions = build_payout_instructions(
                &self.treasury.pubkey(),
                &to,
                amount,
                self.config.payout_compute_unit_limit,
                self.config.priority_fee_micro_lamports,
            )
            .map_err(|e| PayoutError::Rejected(format!("{e:#}")))?;
            let signature = self.send_with_retries(request_id, &instructions).await?;
            self.submissions().remove(&request_id);
            info!(
                request_id,
                to = %to,
                amount,
                signature = %signature,
                explorer = %self.config.explorer_url(&signature.to_string()),
                "Prize transferred"
            );
            Ok(())
        })
    }
}

/// Build the payout instructions: optional compute-unit limit and price,
/// followed by the System Program transfer.
pub fn build_payout_instructions(
    from: &Pubkey,
    to: &Pubkey,
    lamports: u64,
    compute_unit_limit: u32,
    micro_lamports: u64,
) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::with_capacity(3);

    if compute_unit_limit > 0 || micro_lamports > 0 {
        let compute_budget_id: Pubkey = COMPUTE_BUDGET_PROGRAM_ID
            .parse()
            .context("invalid compute budget program id")?;
        if compute_unit_limit > 0 {
            let mut data = Vec::with_capacity(5);
            data.push(2u8);
            data.extend_from_slice(&compute_unit_limit.to_le_bytes());
            instructions.push(Instruction {
                program_id: compute_budget_id,
                accounts: vec![],
                data,
            });
        }
        if micro_lamports > 0 {
            let mut data = Vec::with_capacity(9);
            data.push(3u8);
            data.extend_from_slice(&micro_lamports.to_le_bytes());
            instructions.push(Instruction {
                program_id: compute_budget_id,
                accounts: vec![],
                data,
            });
        }
    }

    // Bincode layout of SystemInstruction::Transfer: u32 tag || u64 lamports.
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER_TAG.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());

    instructions.push(Instruction {
        // The System Program id is the all-zero key.
        program_id: Pubkey::default(),
        accounts: vec![AccountMeta::new(*from, true), AccountMeta::new(*to, false)],
        data,
    });

    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ledger_credits_recipient() {
        let ledger = LedgerPayout::new();
        let winner = Pubkey::new_from_array([4u8; 32]);

        ledger.transfer(1, winner, 3).await.unwrap();
        ledger.transfer(2, winner, 2).await.unwrap();

        assert_eq!(ledger.balance_of(&winner), 5);
    }

    #[tokio::test]
    async fn ledger_pays_each_request_once() {
        let ledger = LedgerPayout::new();
        let winner = Pubkey::new_from_array([4u8; 32]);

        ledger.transfer(7, winner, 3).await.unwrap();
        ledger.transfer(7, winner, 3).await.unwrap();

        assert_eq!(ledger.balance_of(&winner), 3);
    }

    #[tokio::test]
    async fn blocked_recipient_fails_until_unblocked() {
        let ledger = LedgerPayout::new();
        let winner = Pubkey::new_from_array([4u8; 32]);
        ledger.block(winner);

        assert!(matches!(
            ledger.transfer(1, winner, 3).await,
            Err(PayoutError::Rejected(_))
        ));
        assert_eq!(ledger.balance_of(&winner), 0);

        ledger.unblock(&winner);
        ledger.transfer(1, winner, 3).await.unwrap();
        assert_eq!(ledger.balance_of(&winner), 3);
    }

    #[test]
    fn transfer_status_classification() {
        assert_eq!(classify_transfer(Some(Ok(())), false), TransferStatus::Landed);
        assert_eq!(classify_transfer(Some(Ok(())), true), TransferStatus::Landed);
        assert_eq!(
            classify_transfer(Some(Err(TransactionError::AccountNotFound)), true),
            TransferStatus::Failed
        );
        assert_eq!(classify_transfer(None, true), TransferStatus::Pending);
        assert_eq!(classify_transfer(None, false), TransferStatus::Failed);
    }

    #[test]
    fn payout_transfer_layout() {
        let from = Pubkey::new_from_array([1u8; 32]);
        let to = Pubkey::new_from_array([2u8; 32]);

        let instructions = build_payout_instructions(&from, &to, 1_000, 0, 0).unwrap();
        assert_eq!(instructions.len(), 1);

        let transfer = &instructions[0];
        assert_eq!(transfer.program_id, Pubkey::default());
        assert_eq!(&transfer.data[..4], &2u32.to_le_bytes());
        assert_eq!(&transfer.data[4..], &1_000u64.to_le_bytes());
        assert!(transfer.accounts[0].is_signer);
        assert!(transfer.accounts[0].is_writable);
        assert_eq!(transfer.accounts[1].pubkey, to);
        assert!(!transfer.accounts[1].is_signer);
    }

    #[test]
    fn payout_budget_instructions_come_first() {
        let from = Pubkey::new_from_array([1u8; 32]);
        let to = Pubkey::new_from_array([2u8; 32]);

        let instructions = build_payout_instructions(&from, &to, 1, 200_000, 5_000).unwrap();
        assert_eq!(instructions.len(), 3);
        assert_eq!(instructions[0].data[0], 2);
        assert_eq!(&instructions[0].data[1..], &200_000u32.to_le_bytes());
        assert_eq!(instructions[1].data[0], 3);
        assert_eq!(&instructions[1].data[1..], &5_000u64.to_le_bytes());
        assert_eq!(instructions[2].program_id, Pubkey::default());
    }
}
