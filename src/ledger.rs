//! Append-only ledger of monetary events, sequenced per license
//!
//! Entries live under `<license_id>/<entry_id>` in the `ledger` tree. A head record
//! per license keeps the last assigned id, the running balance and the escrow held;
//! it is updated in the same storage transaction as the entries, and can always be
//! recomputed by folding the entries.
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};

use crate::error::EngineError;
use crate::license::TransitionRef;
use crate::retry::{RetryPolicy, WriteError};
use crate::types::{Amount, LicenseId, TimeStamp};
use crate::utils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(index_only)]
pub enum EntryKind {
    #[n(0)]
    Fee,
    #[n(1)]
    Commission,
    #[n(2)]
    EscrowHold,
    #[n(3)]
    EscrowRelease,
    #[n(4)]
    Refund,
}

impl EntryKind {
    pub fn is_escrow(&self) -> bool {
        matches!(self, EntryKind::EscrowHold | EntryKind::EscrowRelease)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryKind::Fee => "fee",
            EntryKind::Commission => "commission",
            EntryKind::EscrowHold => "escrow-hold",
            EntryKind::EscrowRelease => "escrow-release",
            EntryKind::Refund => "refund",
        })
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fee" => Ok(EntryKind::Fee),
            "commission" => Ok(EntryKind::Commission),
            "escrow-hold" => Ok(EntryKind::EscrowHold),
            "escrow-release" => Ok(EntryKind::EscrowRelease),
            "refund" => Ok(EntryKind::Refund),
            other => Err(format!("unknown entry kind `{other}`")),
        }
    }
}

/// An entry before the store has sequenced it
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct NewEntry {
    #[n(0)]
    pub kind: EntryKind,
    #[n(1)]
    pub amount: Amount, // holder's perspective: charges negative, credits positive
    #[n(2)]
    pub counterparty_id: String,
}

impl NewEntry {
    pub fn new(kind: EntryKind, amount: Amount, counterparty_id: impl Into<String>) -> Self {
        Self {
            kind,
            amount,
            counterparty_id: counterparty_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerEntry {
    #[n(0)]
    pub entry_id: u64,
    #[n(1)]
    pub license_id: LicenseId,
    #[n(2)]
    pub kind: EntryKind,
    #[n(3)]
    pub amount: Amount,
    #[n(4)]
    pub counterparty_id: String,
    #[n(5)]
    pub timestamp: TimeStamp<Utc>,
    #[n(6)]
    pub causing_transition: Option<TransitionRef>,
    #[n(7)]
    pub policy_version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LedgerHead {
    #[n(0)]
    pub last_entry_id: u64,
    #[n(1)]
    pub balance: Amount,
    #[n(2)]
    pub escrow_held: Amount,
}

impl LedgerHead {
    fn push(&mut self, entry: &NewEntry) -> Option<u64> {
        self.balance = self.balance.checked_add(entry.amount)?;
        if entry.kind.is_escrow() {
            // holds are negative and releases positive, so held escrow is their negated sum
            self.escrow_held = self.escrow_held.checked_sub(entry.amount)?;
        }
        self.last_entry_id += 1;
        Some(self.last_entry_id)
    }
}

/// Everything needed to sequence one batch for one license
#[derive(Debug, Clone)]
pub struct EntryBatch<'a> {
    pub license_id: &'a LicenseId,
    pub causing_transition: Option<TransitionRef>,
    pub policy_version: u64,
    pub timestamp: TimeStamp<Utc>,
    pub entries: &'a [NewEntry],
}

pub struct LedgerStore {
    entries: sled::Tree,
    heads: sled::Tree,
    fenced: AtomicBool,
    retry: RetryPolicy,
}

impl LedgerStore {
    pub fn open(db: &sled::Db, retry: RetryPolicy) -> Result<Self, EngineError> {
        Ok(Self {
            entries: db.open_tree("ledger")?,
            heads: db.open_tree("ledger_heads")?,
            fenced: AtomicBool::new(false),
            retry,
        })
    }

    pub(crate) fn entries_tree(&self) -> &sled::Tree {
        &self.entries
    }
    pub(crate) fn heads_tree(&self) -> &sled::Tree {
        &self.heads
    }
    pub(crate) fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Refuse every write until [`LedgerStore::unfence`]. Fenced writes count as
    /// durability failures and go through the retry policy.
    pub fn fence(&self) {
        self.fenced.store(true, Ordering::SeqCst);
        tracing::warn!("ledger fenced, writes will be refused");
    }
    pub fn unfence(&self) {
        self.fenced.store(false, Ordering::SeqCst);
        tracing::info!("ledger unfenced");
    }
    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), WriteError> {
        if self.is_fenced() {
            return Err(WriteError::Transient("ledger is fenced".into()));
        }
        Ok(())
    }

    /// Sequence `batch` inside an open transaction over the ledger and head trees.
    pub(crate) fn stage(
        entries: &TransactionalTree,
        heads: &TransactionalTree,
        batch: &EntryBatch<'_>,
    ) -> Result<Vec<LedgerEntry>, ConflictableTransactionError<EngineError>> {
        let abort = |e: EngineError| ConflictableTransactionError::Abort(e);
        let head_key = batch.license_id.as_str().as_bytes();

        let mut head: LedgerHead = match heads.get(head_key)? {
            Some(raw) => utils::decode(&raw).map_err(abort)?,
            None => LedgerHead::default(),
        };

        let mut sequenced = Vec::with_capacity(batch.entries.len());
        for new in batch.entries {
            let entry_id = head.push(new).ok_or_else(|| {
                abort(EngineError::PolicyViolation(format!(
                    "ledger of {} would overflow",
                    batch.license_id
                )))
            })?;
            if head.escrow_held.is_negative() {
                return Err(abort(EngineError::PolicyViolation(format!(
                    "escrow release exceeds the escrow held by {}",
                    batch.license_id
                ))));
            }

            let entry = LedgerEntry {
                entry_id,
                license_id: batch.license_id.clone(),
                kind: new.kind,
                amount: new.amount,
                counterparty_id: new.counterparty_id.clone(),
                timestamp: batch.timestamp.clone(),
                causing_transition: batch.causing_transition.clone(),
                policy_version: batch.policy_version,
            };
            entries.insert(
                utils::sequenced_key(batch.license_id, entry_id),
                utils::encode(&entry).map_err(abort)?,
            )?;
            sequenced.push(entry);
        }

        if !sequenced.is_empty() {
            heads.insert(head_key, utils::encode(&head).map_err(abort)?)?;
        }
        Ok(sequenced)
    }

    /// Append a batch for one license as a single unit. Either every entry gets an id
    /// and is stored, or none is.
    pub fn append(&self, batch: &EntryBatch<'_>) -> Result<Vec<LedgerEntry>, EngineError> {
        let appended = self.retry.run("ledger append", || {
            self.ensure_writable()?;
            let staged = (&self.entries, &self.heads)
                .transaction(|(entries, heads)| Self::stage(entries, heads, batch))?;
            Ok(staged)
        })?;

        tracing::debug!(
            license_id = %batch.license_id,
            entries = appended.len(),
            "ledger batch appended"
        );
        Ok(appended)
    }

    pub fn head(&self, license_id: &LicenseId) -> Result<LedgerHead, EngineError> {
        match self.heads.get(license_id.as_str().as_bytes())? {
            Some(raw) => utils::decode(&raw),
            None => Ok(LedgerHead::default()),
        }
    }

    /// Running total kept alongside the entries
    pub fn balance_of(&self, license_id: &LicenseId) -> Result<Amount, EngineError> {
        Ok(self.head(license_id)?.balance)
    }

    pub fn escrow_held(&self, license_id: &LicenseId) -> Result<Amount, EngineError> {
        Ok(self.head(license_id)?.escrow_held)
    }

    pub fn entries(&self, license_id: &LicenseId) -> Result<Vec<LedgerEntry>, EngineError> {
        self.entries
            .scan_prefix(utils::license_prefix(license_id))
            .values()
            .map(|raw| utils::decode(&raw?))
            .collect()
    }

    /// Ground truth: the fold of every stored entry in sequence order
    pub fn replay_balance(&self, license_id: &LicenseId) -> Result<Amount, EngineError> {
        self.entries(license_id)?
            .iter()
            .try_fold(Amount::ZERO, |total, entry| total.checked_add(entry.amount))
            .ok_or_else(|| EngineError::Corrupt(format!("ledger of {license_id} overflows")))
    }
}
