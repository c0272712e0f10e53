//! Licensing engine: the one entry point that mutates licenses
//!
//! Every mutation takes the license's lock, evaluates the transition against a single
//! policy snapshot and commits snapshot, history and ledger effects together. Reads go
//! straight to committed storage.
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::entitlement::{self, CapabilitySet, EntitlementResolver};
use crate::error::EngineError;
use crate::ledger::{EntryBatch, EntryKind, LedgerEntry, LedgerStore, NewEntry};
use crate::license::{License, LicenseState, TransitionKind, TransitionRecord, TransitionRef};
use crate::locks::{LockMode, LockRegistry};
use crate::policy::{EscrowMode, PolicyDocument, PolicySet, PolicyTable};
use crate::repository::{Commit, LicenseRepository, OutboxCredit};
use crate::retry::RetryPolicy;
use crate::state_machine::{TransitionContext, TransitionOutcome, TransitionRequest, attempt_transition};
use crate::types::{Amount, HolderId, LicenseId, ModuleId, Role};
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub lock_mode: LockMode,
    pub flush_on_commit: bool,
}

/// What a committed transition produced
#[derive(Debug, Clone)]
pub struct Receipt {
    pub license: License,
    pub transition: TransitionRecord,
    pub entries: Vec<LedgerEntry>,
    /// Commission credits that reached their beneficiaries right after the commit
    pub credits_delivered: usize,
}

pub struct LicensingEngine {
    instance: Arc<sled::Db>,
    repository: LicenseRepository,
    ledger: LedgerStore,
    policies: PolicyTable,
    locks: LockRegistry,
    entitlements: EntitlementResolver,
    clock: Arc<dyn Clock>,
    flush_on_commit: bool,
}

impl LicensingEngine {
    /// Open the engine over `instance`. `bootstrap` is published as policy version 1
    /// when the store has no policy yet and ignored otherwise.
    pub fn open(
        instance: Arc<sled::Db>,
        settings: EngineSettings,
        bootstrap: Option<PolicyDocument>,
    ) -> Result<Self, EngineError> {
        Self::with_clock(instance, settings, bootstrap, Arc::new(SystemClock))
    }

    pub fn with_clock(
        instance: Arc<sled::Db>,
        settings: EngineSettings,
        bootstrap: Option<PolicyDocument>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let repository = LicenseRepository::open(&instance)?;
        let ledger = LedgerStore::open(&instance, settings.retry)?;
        let policies = PolicyTable::open(&instance, bootstrap)?;

        Ok(Self {
            instance,
            repository,
            ledger,
            policies,
            locks: LockRegistry::new(settings.lock_mode),
            entitlements: EntitlementResolver::new(),
            clock,
            flush_on_commit: settings.flush_on_commit,
        })
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn repository(&self) -> &LicenseRepository {
        &self.repository
    }

    /// Persist a draft. It is checked as if it were being issued now, so a draft that
    /// the current policy would refuse is never stored.
    pub fn draft(
        &self,
        holder_id: HolderId,
        modules: BTreeSet<ModuleId>,
        role: &Role,
    ) -> Result<License, EngineError> {
        let policy = self.policies.current();
        let draft = License::draft(utils::new_license_id()?, holder_id, modules, self.clock.now());
        self.evaluate(&draft, &TransitionRequest::new(TransitionKind::Issue, role.clone()), &policy)?;

        self.repository.commit(
            &self.ledger,
            &Commit {
                expected_transition_id: None,
                genesis: Some(&draft),
                license: &draft,
                record: None,
                entries: None,
                credits: &[],
            },
        )?;
        self.flush();

        tracing::info!(license_id = %draft.license_id(), holder_id = %draft.holder_id(), "license drafted");
        Ok(draft)
    }

    pub fn issue_draft(&self, license_id: &LicenseId, role: &Role) -> Result<Receipt, EngineError> {
        self.transition(
            license_id,
            None,
            TransitionRequest::new(TransitionKind::Issue, role.clone()),
        )
    }

    /// Draft and issue in one commit
    pub fn issue(
        &self,
        holder_id: HolderId,
        modules: BTreeSet<ModuleId>,
        role: &Role,
    ) -> Result<Receipt, EngineError> {
        let policy = self.policies.current();
        let draft = License::draft(utils::new_license_id()?, holder_id, modules, self.clock.now());
        let request = TransitionRequest::new(TransitionKind::Issue, role.clone());

        let guard = self.locks.acquire(draft.license_id())?;
        let outcome = self.evaluate(&draft, &request, &policy)?;
        let entries = self.commit(&outcome, None, Some(&draft))?;
        drop(guard);

        Ok(self.receipt(outcome, entries))
    }

    pub fn change_modules(
        &self,
        license_id: &LicenseId,
        add: BTreeSet<ModuleId>,
        remove: BTreeSet<ModuleId>,
        role: &Role,
    ) -> Result<Receipt, EngineError> {
        self.transition(
            license_id,
            None,
            TransitionRequest::change_modules(role.clone(), add, remove),
        )
    }

    /// Like [`LicensingEngine::change_modules`] but only if the license has not moved past
    /// `expected_transition_id`; otherwise [`EngineError::LicenseBusy`].
    pub fn change_modules_if(
        &self,
        license_id: &LicenseId,
        expected_transition_id: u64,
        add: BTreeSet<ModuleId>,
        remove: BTreeSet<ModuleId>,
        role: &Role,
    ) -> Result<Receipt, EngineError> {
        self.transition(
            license_id,
            Some(expected_transition_id),
            TransitionRequest::change_modules(role.clone(), add, remove),
        )
    }

    pub fn suspend(&self, license_id: &LicenseId, role: &Role) -> Result<Receipt, EngineError> {
        self.transition(license_id, None, TransitionRequest::new(TransitionKind::Suspend, role.clone()))
    }

    pub fn reinstate(&self, license_id: &LicenseId, role: &Role) -> Result<Receipt, EngineError> {
        self.transition(license_id, None, TransitionRequest::new(TransitionKind::Reinstate, role.clone()))
    }

    pub fn terminate(&self, license_id: &LicenseId, role: &Role) -> Result<Receipt, EngineError> {
        self.transition(license_id, None, TransitionRequest::new(TransitionKind::Terminate, role.clone()))
    }

    /// A monetary event outside any transition, e.g. usage billing or a manual refund
    pub fn record_transaction(
        &self,
        license_id: &LicenseId,
        kind: EntryKind,
        amount: Amount,
        counterparty_id: &str,
    ) -> Result<LedgerEntry, EngineError> {
        let _guard = self.locks.acquire(license_id)?;
        let license = self.repository.load_existing(license_id)?;
        let policy = self.policies.current();
        check_billable(&license, kind, amount, &policy)?;

        let entry = [NewEntry::new(kind, amount, counterparty_id)];
        let mut appended = self.ledger.append(&EntryBatch {
            license_id,
            causing_transition: None,
            policy_version: policy.version,
            timestamp: self.clock.now(),
            entries: &entry,
        })?;
        self.flush();

        appended
            .pop()
            .ok_or_else(|| EngineError::Corrupt(format!("ledger of {license_id} accepted an empty batch")))
    }

    pub fn publish_policy(&self, role: &Role, document: PolicyDocument) -> Result<Arc<PolicySet>, EngineError> {
        let published = self.policies.publish(role, document)?;
        self.entitlements.invalidate_all();
        Ok(published)
    }

    pub fn license(&self, license_id: &LicenseId) -> Result<License, EngineError> {
        self.repository.load_existing(license_id)
    }

    pub fn history(&self, license_id: &LicenseId) -> Result<Vec<TransitionRecord>, EngineError> {
        self.repository.history(license_id)
    }

    /// Replay genesis and history and check the result against the stored snapshot
    pub fn rebuild(&self, license_id: &LicenseId) -> Result<License, EngineError> {
        let genesis = self
            .repository
            .genesis(license_id)?
            .ok_or_else(|| EngineError::LicenseNotFound(license_id.clone()))?;
        let replayed = License::replay(&genesis, &self.repository.history(license_id)?)?;

        let stored = self.repository.load_existing(license_id)?;
        if replayed != stored {
            return Err(EngineError::Corrupt(format!(
                "snapshot of {license_id} diverges from its history at transition {}",
                stored.last_transition_id()
            )));
        }
        Ok(replayed)
    }

    pub fn balance_of(&self, license_id: &LicenseId) -> Result<Amount, EngineError> {
        self.ledger.balance_of(license_id)
    }

    pub fn replay_balance(&self, license_id: &LicenseId) -> Result<Amount, EngineError> {
        self.ledger.replay_balance(license_id)
    }

    pub fn entries(&self, license_id: &LicenseId) -> Result<Vec<LedgerEntry>, EngineError> {
        self.ledger.entries(license_id)
    }

    pub fn escrow_held(&self, license_id: &LicenseId) -> Result<Amount, EngineError> {
        self.ledger.escrow_held(license_id)
    }

    pub fn resolve(&self, license_id: &LicenseId, role: &Role) -> Result<CapabilitySet, EngineError> {
        let license = self.repository.load_existing(license_id)?;
        let policy = self.policies.current();
        Ok(self.entitlements.resolve_cached(&license, role, &policy))
    }

    pub fn visible_modules(&self, license_id: &LicenseId, role: &Role) -> Result<BTreeSet<ModuleId>, EngineError> {
        Ok(entitlement::visible_modules(&self.resolve(license_id, role)?))
    }

    /// Retry every parked commission credit. Returns how many were delivered.
    pub fn deliver_pending_credits(&self) -> Result<usize, EngineError> {
        let pending = self.repository.pending_credits()?;
        Ok(self.deliver(pending))
    }

    fn transition(
        &self,
        license_id: &LicenseId,
        expected_transition_id: Option<u64>,
        request: TransitionRequest,
    ) -> Result<Receipt, EngineError> {
        let guard = self.locks.acquire(license_id)?;
        let license = self.repository.load_existing(license_id)?;
        if let Some(expected) = expected_transition_id {
            if license.last_transition_id() != expected {
                tracing::debug!(
                    license_id = %license_id,
                    expected,
                    found = license.last_transition_id(),
                    "conditioned change refused"
                );
                return Err(EngineError::LicenseBusy(license_id.clone()));
            }
        }

        let policy = self.policies.current();
        let outcome = self.evaluate(&license, &request, &policy)?;
        let entries = self.commit(&outcome, Some(license.last_transition_id()), None)?;
        drop(guard);

        Ok(self.receipt(outcome, entries))
    }

    fn evaluate(
        &self,
        license: &License,
        request: &TransitionRequest,
        policy: &PolicySet,
    ) -> Result<TransitionOutcome, EngineError> {
        let ctx = TransitionContext {
            policy,
            now: self.clock.now(),
            escrow_held: self.ledger.escrow_held(license.license_id())?,
        };
        attempt_transition(license, request, &ctx).inspect_err(|e| {
            tracing::debug!(
                license_id = %license.license_id(),
                kind = %request.kind,
                role = %request.role,
                "transition refused: {e}"
            );
        })
    }

    fn commit(
        &self,
        outcome: &TransitionOutcome,
        expected_transition_id: Option<u64>,
        genesis: Option<&License>,
    ) -> Result<Vec<LedgerEntry>, EngineError> {
        let license_id = outcome.license.license_id();
        let record = &outcome.record;
        let batch = EntryBatch {
            license_id,
            causing_transition: Some(TransitionRef {
                license_id: license_id.clone(),
                transition_id: record.transition_id,
            }),
            policy_version: record.policy_version,
            timestamp: record.at.clone(),
            entries: &outcome.entries,
        };

        let entries = self.repository.commit(
            &self.ledger,
            &Commit {
                expected_transition_id,
                genesis,
                license: &outcome.license,
                record: Some(record),
                entries: Some(batch),
                credits: &outcome.credits,
            },
        )?;
        self.entitlements.invalidate(license_id);
        self.flush();

        tracing::info!(
            license_id = %license_id,
            transition_id = record.transition_id,
            kind = %record.kind,
            state = %record.to,
            policy_version = record.policy_version,
            entries = entries.len(),
            "transition committed"
        );
        Ok(entries)
    }

    fn receipt(&self, outcome: TransitionOutcome, entries: Vec<LedgerEntry>) -> Receipt {
        let credits_delivered = if outcome.credits.is_empty() {
            0
        } else {
            let cause = TransitionRef {
                license_id: outcome.license.license_id().clone(),
                transition_id: outcome.record.transition_id,
            };
            match self.repository.pending_credits_for(&cause) {
                Ok(pending) => self.deliver(pending),
                Err(e) => {
                    tracing::warn!(%cause, "could not read parked credits: {e}");
                    0
                }
            }
        };

        Receipt {
            license: outcome.license,
            transition: outcome.record,
            entries,
            credits_delivered,
        }
    }

    /// Each credit is appended under its beneficiary's lock, gated by the same state rules
    /// as [`LicensingEngine::record_transaction`]. Anything refused or failed stays parked
    /// for the next [`LicensingEngine::deliver_pending_credits`].
    fn deliver(&self, pending: Vec<(sled::IVec, OutboxCredit)>) -> usize {
        let mut delivered = 0;
        for (key, credit) in pending {
            let result = self
                .locks
                .acquire(&credit.beneficiary)
                .and_then(|_guard| {
                    let beneficiary = self.repository.load_existing(&credit.beneficiary)?;
                    check_billable(
                        &beneficiary,
                        credit.entry.kind,
                        credit.entry.amount,
                        &self.policies.current(),
                    )?;
                    self.repository.deliver(&self.ledger, &key, &credit)
                });

            match result {
                Ok(entries) if !entries.is_empty() => {
                    delivered += 1;
                    tracing::debug!(
                        license_id = %credit.beneficiary,
                        cause = %credit.cause,
                        amount = %credit.entry.amount,
                        "credit delivered"
                    );
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    license_id = %credit.beneficiary,
                    cause = %credit.cause,
                    "credit left in outbox: {e}"
                ),
            }
        }
        if delivered > 0 {
            self.flush();
        }
        delivered
    }

    fn flush(&self) {
        if !self.flush_on_commit {
            return;
        }
        // the transaction already committed; a failed flush only delays durability
        if let Err(e) = self.instance.flush() {
            tracing::error!("flush after commit failed: {e}");
        }
    }
}

/// Whether a standalone ledger event may be recorded against `license` in its current state
fn check_billable(
    license: &License,
    kind: EntryKind,
    amount: Amount,
    policy: &PolicySet,
) -> Result<(), EngineError> {
    let allowed = match license.state() {
        LicenseState::Active => true,
        LicenseState::Suspended => {
            kind == EntryKind::Refund
                || (kind.is_escrow() && policy.escrow_during_suspension == EscrowMode::Accrue)
        }
        LicenseState::Draft | LicenseState::Terminated => false,
    };
    if !allowed {
        return Err(EngineError::LicenseNotActive {
            license_id: license.license_id().clone(),
            state: license.state(),
        });
    }

    if amount.is_zero() {
        return Err(EngineError::PolicyViolation("a ledger event must move money".into()));
    }
    match kind {
        EntryKind::EscrowHold if !amount.is_negative() => Err(EngineError::PolicyViolation(
            "an escrow hold must be a negative amount".into(),
        )),
        EntryKind::EscrowRelease if !amount.is_positive() => Err(EngineError::PolicyViolation(
            "an escrow release must be a positive amount".into(),
        )),
        _ => Ok(()),
    }
}
