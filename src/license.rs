//! License snapshots, lifecycle states and the transition history they are replayed from
use std::collections::BTreeSet;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::{HolderId, LicenseId, ModuleId, Role, TimeStamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cbor(index_only)]
pub enum LicenseState {
    #[n(0)]
    Draft,
    #[n(1)]
    Active,
    #[n(2)]
    Suspended,
    #[n(3)]
    Terminated,
}

impl LicenseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LicenseState::Terminated)
    }
}

impl fmt::Display for LicenseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LicenseState::Draft => "draft",
            LicenseState::Active => "active",
            LicenseState::Suspended => "suspended",
            LicenseState::Terminated => "terminated",
        })
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
)]
#[cbor(index_only)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionKind {
    #[n(0)]
    Issue,
    #[n(1)]
    Upgrade,
    #[n(2)]
    Downgrade,
    #[n(3)]
    Suspend,
    #[n(4)]
    Reinstate,
    #[n(5)]
    Terminate,
}

impl TransitionKind {
    pub const ALL: [TransitionKind; 6] = [
        TransitionKind::Issue,
        TransitionKind::Upgrade,
        TransitionKind::Downgrade,
        TransitionKind::Suspend,
        TransitionKind::Reinstate,
        TransitionKind::Terminate,
    ];

    /// The state this transition leads to from `from`, or `None` if the edge does not exist.
    pub fn target(&self, from: LicenseState) -> Option<LicenseState> {
        use LicenseState::*;
        match (self, from) {
            (TransitionKind::Issue, Draft) => Some(Active),
            (TransitionKind::Upgrade | TransitionKind::Downgrade, Active) => Some(Active),
            (TransitionKind::Suspend, Active) => Some(Suspended),
            (TransitionKind::Reinstate, Suspended) => Some(Active),
            (TransitionKind::Terminate, Active | Suspended) => Some(Terminated),
            _ => None,
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransitionKind::Issue => "issue",
            TransitionKind::Upgrade => "upgrade",
            TransitionKind::Downgrade => "downgrade",
            TransitionKind::Suspend => "suspend",
            TransitionKind::Reinstate => "reinstate",
            TransitionKind::Terminate => "terminate",
        })
    }
}

/// Points at one committed transition of one license. Ledger entries produced by
/// that transition, including credits landing on other licenses, carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub struct TransitionRef {
    #[n(0)]
    pub license_id: LicenseId,
    #[n(1)]
    pub transition_id: u64,
}

impl fmt::Display for TransitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.license_id, self.transition_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct TransitionRecord {
    #[n(0)]
    pub transition_id: u64,
    #[n(1)]
    pub kind: TransitionKind,
    #[n(2)]
    pub from: LicenseState,
    #[n(3)]
    pub to: LicenseState,
    #[n(4)]
    pub requesting_role: Role,
    #[n(5)]
    pub policy_version: u64,
    #[n(6)]
    pub at: TimeStamp<Utc>,
    #[n(7)]
    pub modules_added: BTreeSet<ModuleId>,
    #[n(8)]
    pub modules_removed: BTreeSet<ModuleId>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct License {
    #[n(0)]
    license_id: LicenseId,
    #[n(1)]
    holder_id: HolderId,
    #[n(2)]
    module_set: BTreeSet<ModuleId>,
    #[n(3)]
    state: LicenseState,
    #[n(4)]
    created_at: TimeStamp<Utc>,
    #[n(5)]
    last_transition_at: TimeStamp<Utc>,
    #[n(6)]
    last_transition_id: u64, // 0 until issued
    #[n(7)]
    issued_at: Option<TimeStamp<Utc>>,
}

impl License {
    /// A license as first created: in draft, holding the modules requested for issuance
    pub fn draft(
        license_id: LicenseId,
        holder_id: HolderId,
        requested: BTreeSet<ModuleId>,
        created_at: TimeStamp<Utc>,
    ) -> Self {
        Self {
            license_id,
            holder_id,
            module_set: requested,
            state: LicenseState::Draft,
            last_transition_at: created_at.clone(),
            created_at,
            last_transition_id: 0,
            issued_at: None,
        }
    }

    pub fn license_id(&self) -> &LicenseId {
        &self.license_id
    }
    pub fn holder_id(&self) -> &HolderId {
        &self.holder_id
    }
    pub fn module_set(&self) -> &BTreeSet<ModuleId> {
        &self.module_set
    }
    pub fn state(&self) -> LicenseState {
        self.state
    }
    pub fn created_at(&self) -> &TimeStamp<Utc> {
        &self.created_at
    }
    pub fn last_transition_at(&self) -> &TimeStamp<Utc> {
        &self.last_transition_at
    }
    pub fn last_transition_id(&self) -> u64 {
        self.last_transition_id
    }
    /// Start of the first billing period
    pub fn issued_at(&self) -> Option<&TimeStamp<Utc>> {
        self.issued_at.as_ref()
    }
    pub fn holds(&self, module: &ModuleId) -> bool {
        self.module_set.contains(module)
    }

    /// Apply a committed record without re-checking policy. Only the edge and the
    /// sequence are verified, which is all a replay can know.
    pub(crate) fn apply(&mut self, record: &TransitionRecord) -> Result<(), EngineError> {
        if record.transition_id != self.last_transition_id + 1 {
            return Err(EngineError::Corrupt(format!(
                "license {} expected transition {}, found {}",
                self.license_id,
                self.last_transition_id + 1,
                record.transition_id
            )));
        }
        if record.from != self.state || record.kind.target(self.state) != Some(record.to) {
            return Err(EngineError::Corrupt(format!(
                "license {} cannot {} from {} to {}",
                self.license_id, record.kind, record.from, record.to
            )));
        }

        self.module_set.extend(record.modules_added.iter().cloned());
        self.module_set
            .retain(|module| !record.modules_removed.contains(module));
        if record.kind == TransitionKind::Issue {
            self.issued_at = Some(record.at.clone());
        }
        self.state = record.to;
        self.last_transition_id = record.transition_id;
        self.last_transition_at = record.at.clone();

        Ok(())
    }

    /// Rebuild a license purely from its genesis draft and its ordered transition history
    pub fn replay(genesis: &License, records: &[TransitionRecord]) -> Result<License, EngineError> {
        let mut license = genesis.clone();
        for record in records {
            license.apply(record)?;
        }
        Ok(license)
    }

    /// A printable listing of `records` headed by this license
    pub fn view_history<'a>(&'a self, records: &'a [TransitionRecord]) -> HistoryView<'a> {
        HistoryView {
            license: self,
            records,
        }
    }
}

pub struct HistoryView<'a> {
    license: &'a License,
    records: &'a [TransitionRecord],
}

impl fmt::Display for HistoryView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "history of {} (holder {})",
            self.license.license_id, self.license.holder_id
        )?;
        for record in self.records {
            writeln!(
                f,
                "  #{:<3} {:<10} {:>10} -> {:<10} by {:<10} policy v{} at {}",
                record.transition_id,
                record.kind.to_string(),
                record.from.to_string(),
                record.to.to_string(),
                record.requesting_role.as_str(),
                record.policy_version,
                record.at
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules(names: &[&str]) -> BTreeSet<ModuleId> {
        names.iter().map(|n| ModuleId::from(*n)).collect()
    }

    fn record(
        id: u64,
        kind: TransitionKind,
        from: LicenseState,
        added: &[&str],
        removed: &[&str],
    ) -> TransitionRecord {
        TransitionRecord {
            transition_id: id,
            kind,
            from,
            to: kind.target(from).unwrap(),
            requesting_role: Role::from("governor"),
            policy_version: 1,
            at: TimeStamp::new(),
            modules_added: modules(added),
            modules_removed: modules(removed),
        }
    }

    #[test]
    fn only_defined_edges_have_targets() {
        use LicenseState::*;
        let states = [Draft, Active, Suspended, Terminated];
        let defined: usize = TransitionKind::ALL
            .iter()
            .map(|kind| states.iter().filter(|s| kind.target(**s).is_some()).count())
            .sum();
        // issue, upgrade, downgrade, suspend, reinstate, terminate x2
        assert_eq!(defined, 7);
        assert!(TransitionKind::ALL.iter().all(|k| k.target(Terminated).is_none()));
    }

    #[test]
    fn replay_follows_history() {
        let genesis = License::draft(
            LicenseId::from("lic1test"),
            HolderId::from("acme"),
            modules(&["inventory"]),
            TimeStamp::new(),
        );
        let history = vec![
            record(1, TransitionKind::Issue, LicenseState::Draft, &["inventory"], &[]),
            record(2, TransitionKind::Upgrade, LicenseState::Active, &["orders"], &[]),
            record(3, TransitionKind::Suspend, LicenseState::Active, &[], &[]),
            record(
                4,
                TransitionKind::Terminate,
                LicenseState::Suspended,
                &[],
                &["inventory", "orders"],
            ),
        ];

        let replayed = License::replay(&genesis, &history[..2]).unwrap();
        assert_eq!(replayed.module_set(), &modules(&["inventory", "orders"]));
        assert_eq!(replayed.state(), LicenseState::Active);

        let terminated = License::replay(&genesis, &history).unwrap();
        assert_eq!(terminated.state(), LicenseState::Terminated);
        assert!(terminated.module_set().is_empty());
        assert_eq!(terminated.last_transition_id(), 4);
    }

    #[test]
    fn replay_rejects_gaps_and_illegal_edges() {
        let genesis = License::draft(
            LicenseId::from("lic1test"),
            HolderId::from("acme"),
            modules(&["inventory"]),
            TimeStamp::new(),
        );
        let gap = vec![record(2, TransitionKind::Issue, LicenseState::Draft, &[], &[])];
        assert!(matches!(
            License::replay(&genesis, &gap),
            Err(EngineError::Corrupt(_))
        ));

        let mut illegal = record(1, TransitionKind::Issue, LicenseState::Draft, &[], &[]);
        illegal.to = LicenseState::Suspended;
        assert!(License::replay(&genesis, &[illegal]).is_err());
    }

    #[test]
    fn license_cbor_roundtrip() {
        let license = License::draft(
            LicenseId::from("lic1test"),
            HolderId::from("acme"),
            modules(&["inventory", "orders"]),
            TimeStamp::new(),
        );
        let encoded = minicbor::to_vec(&license).unwrap();
        let decoded: License = minicbor::decode(&encoded).unwrap();
        assert_eq!(license, decoded);
    }

    #[test]
    fn history_view_lists_one_line_per_transition() {
        let genesis = License::draft(
            LicenseId::from("lic1test"),
            HolderId::from("acme"),
            modules(&["inventory"]),
            TimeStamp::new(),
        );
        let history = vec![
            record(1, TransitionKind::Issue, LicenseState::Draft, &["inventory"], &[]),
            record(2, TransitionKind::Suspend, LicenseState::Active, &[], &[]),
        ];
        let rendered = genesis.view_history(&history).to_string();
        let lines: Vec<&str> = rendered.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "history of lic1test (holder acme)");
        assert!(lines[2].starts_with("  #2"));
        assert!(lines[2].contains("suspend"));
    }
}
