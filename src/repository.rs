//! Durable license storage
//!
//! A transition is committed in one sled transaction spanning the snapshot, the
//! transition history, the ledger and the credit outbox. Readers therefore never see
//! a new state without its ledger entries, or entries without their state.
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError};

use chrono::Utc;

use crate::error::EngineError;
use crate::ledger::{EntryBatch, LedgerEntry, LedgerStore, NewEntry};
use crate::license::{License, TransitionRecord, TransitionRef};
use crate::state_machine::PendingCredit;
use crate::types::{LicenseId, TimeStamp};
use crate::utils;

/// A credit owed to another license, parked until it can be appended under that license's lock
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct OutboxCredit {
    #[n(0)]
    pub beneficiary: LicenseId,
    #[n(1)]
    pub entry: NewEntry,
    #[n(2)]
    pub cause: TransitionRef,
    #[n(3)]
    pub policy_version: u64,
    #[n(4)]
    pub timestamp: TimeStamp<Utc>,
}

/// Everything one mutation writes, staged together
pub(crate) struct Commit<'a> {
    /// `None` when the license must not exist yet
    pub expected_transition_id: Option<u64>,
    pub genesis: Option<&'a License>,
    pub license: &'a License,
    pub record: Option<&'a TransitionRecord>,
    pub entries: Option<EntryBatch<'a>>,
    pub credits: &'a [PendingCredit],
}

pub struct LicenseRepository {
    licenses: sled::Tree,
    genesis: sled::Tree,
    transitions: sled::Tree,
    outbox: sled::Tree,
}

impl LicenseRepository {
    pub fn open(db: &sled::Db) -> Result<Self, EngineError> {
        Ok(Self {
            licenses: db.open_tree("licenses")?,
            genesis: db.open_tree("genesis")?,
            transitions: db.open_tree("transitions")?,
            outbox: db.open_tree("credit_outbox")?,
        })
    }

    pub fn load(&self, license_id: &LicenseId) -> Result<Option<License>, EngineError> {
        self.licenses
            .get(license_id.as_str().as_bytes())?
            .map(|raw| utils::decode(&raw))
            .transpose()
    }

    pub fn load_existing(&self, license_id: &LicenseId) -> Result<License, EngineError> {
        self.load(license_id)?
            .ok_or_else(|| EngineError::LicenseNotFound(license_id.clone()))
    }

    pub fn genesis(&self, license_id: &LicenseId) -> Result<Option<License>, EngineError> {
        self.genesis
            .get(license_id.as_str().as_bytes())?
            .map(|raw| utils::decode(&raw))
            .transpose()
    }

    pub fn history(&self, license_id: &LicenseId) -> Result<Vec<TransitionRecord>, EngineError> {
        self.transitions
            .scan_prefix(utils::license_prefix(license_id))
            .values()
            .map(|raw| utils::decode(&raw?))
            .collect()
    }

    pub fn license_ids(&self) -> Result<Vec<LicenseId>, EngineError> {
        self.licenses
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                let id = std::str::from_utf8(&key)
                    .map_err(|e| EngineError::Corrupt(format!("license key: {e}")))?;
                Ok(LicenseId::from(id))
            })
            .collect()
    }

    /// Undelivered credits, grouped by paying license in transition order
    pub fn pending_credits(&self) -> Result<Vec<(sled::IVec, OutboxCredit)>, EngineError> {
        self.outbox
            .iter()
            .map(|item| {
                let (key, raw) = item?;
                Ok((key, utils::decode(&raw)?))
            })
            .collect()
    }

    /// Credits parked by one transition that have not been delivered yet
    pub fn pending_credits_for(
        &self,
        cause: &TransitionRef,
    ) -> Result<Vec<(sled::IVec, OutboxCredit)>, EngineError> {
        self.outbox
            .scan_prefix(utils::sequenced_key(&cause.license_id, cause.transition_id))
            .map(|item| {
                let (key, raw) = item?;
                Ok((key, utils::decode(&raw)?))
            })
            .collect()
    }

    /// Write a whole mutation or nothing, retrying transient storage failures
    pub(crate) fn commit(
        &self,
        ledger: &LedgerStore,
        commit: &Commit<'_>,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        ledger.retry().run("license commit", || {
            ledger.ensure_writable()?;
            Ok(self.commit_once(ledger, commit)?)
        })
    }

    fn commit_once(
        &self,
        ledger: &LedgerStore,
        commit: &Commit<'_>,
    ) -> Result<Vec<LedgerEntry>, TransactionError<EngineError>> {
        let abort = |e: EngineError| ConflictableTransactionError::Abort(e);
        let license_id = commit.license.license_id();
        let license_key = license_id.as_str().as_bytes();

        (
            &self.licenses,
            &self.genesis,
            &self.transitions,
            ledger.entries_tree(),
            ledger.heads_tree(),
            &self.outbox,
        )
            .transaction(|(licenses, genesis, transitions, entries, heads, outbox)| {
                let stored: Option<License> = match licenses.get(license_key)? {
                    Some(raw) => Some(utils::decode(&raw).map_err(abort)?),
                    None => None,
                };
                let stored_id = stored.as_ref().map(License::last_transition_id);
                if stored_id != commit.expected_transition_id {
                    return Err(abort(EngineError::LicenseBusy(license_id.clone())));
                }

                if let Some(draft) = commit.genesis {
                    genesis.insert(license_key, utils::encode(draft).map_err(abort)?)?;
                }
                if let Some(record) = commit.record {
                    transitions.insert(
                        utils::sequenced_key(license_id, record.transition_id),
                        utils::encode(record).map_err(abort)?,
                    )?;
                }
                licenses.insert(license_key, utils::encode(commit.license).map_err(abort)?)?;

                let appended = match &commit.entries {
                    Some(batch) => LedgerStore::stage(entries, heads, batch)?,
                    None => Vec::new(),
                };

                if let (Some(record), Some(batch)) = (commit.record, &commit.entries) {
                    let cause = TransitionRef {
                        license_id: license_id.clone(),
                        transition_id: record.transition_id,
                    };
                    for (index, credit) in commit.credits.iter().enumerate() {
                        let mut key = utils::sequenced_key(license_id, record.transition_id);
                        key.extend_from_slice(&(index as u16).to_be_bytes());
                        let parked = OutboxCredit {
                            beneficiary: credit.beneficiary.clone(),
                            entry: credit.entry.clone(),
                            cause: cause.clone(),
                            policy_version: batch.policy_version,
                            timestamp: batch.timestamp.clone(),
                        };
                        outbox.insert(key, utils::encode(&parked).map_err(abort)?)?;
                    }
                }

                Ok(appended)
            })
    }

    /// Append a parked credit to its beneficiary's ledger and drop it from the outbox.
    /// Returns nothing if another delivery got there first.
    pub(crate) fn deliver(
        &self,
        ledger: &LedgerStore,
        key: &[u8],
        credit: &OutboxCredit,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        let batch = EntryBatch {
            license_id: &credit.beneficiary,
            causing_transition: Some(credit.cause.clone()),
            policy_version: credit.policy_version,
            timestamp: credit.timestamp.clone(),
            entries: std::slice::from_ref(&credit.entry),
        };

        ledger.retry().run("credit delivery", || {
            ledger.ensure_writable()?;
            let delivered = (&self.outbox, ledger.entries_tree(), ledger.heads_tree())
                .transaction(|(outbox, entries, heads)| {
                    if outbox.remove(key)?.is_none() {
                        return Ok(Vec::new());
                    }
                    LedgerStore::stage(entries, heads, &batch)
                })?;
            Ok(delivered)
        })
    }
}
