//! Governance policy table: versioned, immutable rule sets consulted by every transition
//!
//! A [`PolicyDocument`] is the editable body a governance role publishes. Publishing
//! stamps it with the next version number and a digest and keeps every earlier
//! version around, so a ledger entry stamped with `policy_version = n` can always
//! be explained against the exact rules that produced it.
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::license::TransitionKind;
use crate::types::{Amount, LicenseId, ModuleId, Role, TimeStamp};
use crate::utils;

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FeeFormula {
    #[default]
    #[n(0)]
    None,
    /// Charged in full every time the rule applies
    #[n(1)]
    Flat {
        #[n(0)]
        amount: Amount,
    },
    /// Price per billing period, scaled to the time left in the current period.
    /// Charged on issue, upgrade and reinstate; credited on downgrade, suspend and terminate.
    #[n(2)]
    Prorated {
        #[n(0)]
        period_price: Amount,
    },
}

/// Share of every fee a rule charges that is credited to another license
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct CommissionSplit {
    #[n(0)]
    pub beneficiary: LicenseId,
    #[n(1)]
    pub basis_points: u32,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[cbor(index_only)]
#[serde(rename_all = "kebab-case")]
pub enum EscrowMode {
    /// No escrow movements while a license is suspended
    #[default]
    #[n(0)]
    Frozen,
    #[n(1)]
    Accrue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct PolicyRule {
    /// `None` makes the rule license-wide: it applies once per transition
    #[n(0)]
    #[serde(default)]
    pub module: Option<ModuleId>,
    #[n(1)]
    pub kind: TransitionKind,
    #[n(2)]
    pub approving_roles: BTreeSet<Role>,
    #[n(3)]
    #[serde(default)]
    pub fee: FeeFormula,
    #[n(4)]
    #[serde(default)]
    pub commissions: Vec<CommissionSplit>,
    #[n(5)]
    #[serde(default)]
    pub escrow_hold: Option<Amount>,
}

impl PolicyRule {
    pub fn approves(&self, role: &Role) -> bool {
        self.approving_roles.contains(role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct OperationSpec {
    #[n(0)]
    pub id: String,
    /// Still granted while the license is suspended
    #[n(1)]
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct ModuleSpec {
    #[n(0)]
    pub id: ModuleId,
    #[n(1)]
    #[serde(default = "default_true")]
    pub licensable: bool,
    #[n(2)]
    #[serde(default)]
    pub prerequisites: BTreeSet<ModuleId>,
    #[n(3)]
    #[serde(default)]
    pub operations: Vec<OperationSpec>,
}

/// What a role may do inside any module it can see. `*` grants every operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct RoleGrant {
    #[n(0)]
    pub role: Role,
    #[n(1)]
    #[serde(default)]
    pub level: u8,
    #[n(2)]
    #[serde(default)]
    pub operations: BTreeSet<String>,
}

pub const WILDCARD: &str = "*";

impl RoleGrant {
    pub fn permits(&self, module: &ModuleId, operation: &str) -> bool {
        self.operations.contains(WILDCARD)
            || self.operations.contains(operation)
            || self
                .operations
                .contains(&format!("{}:{}", module.as_str(), operation))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode)]
pub struct PolicyDocument {
    /// Counterparty of every fee and escrow hold
    #[n(0)]
    #[serde(default = "default_platform_account")]
    pub platform_account: String,
    #[n(1)]
    #[serde(default = "default_billing_period_days")]
    pub billing_period_days: u32,
    #[n(2)]
    #[serde(default)]
    pub escrow_during_suspension: EscrowMode,
    #[n(3)]
    pub governance_roles: BTreeSet<Role>,
    #[n(4)]
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    #[n(5)]
    #[serde(default)]
    pub roles: Vec<RoleGrant>,
    #[n(6)]
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

fn default_true() -> bool {
    true
}

fn default_platform_account() -> String {
    "platform".to_string()
}

fn default_billing_period_days() -> u32 {
    30
}

impl PolicyDocument {
    pub fn module(&self, id: &ModuleId) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| &m.id == id)
    }

    pub fn role(&self, role: &Role) -> Option<&RoleGrant> {
        self.roles.iter().find(|r| &r.role == role)
    }

    pub fn license_rule(&self, kind: TransitionKind) -> Option<&PolicyRule> {
        self.rules
            .iter()
            .find(|r| r.kind == kind && r.module.is_none())
    }

    pub fn module_rule(&self, module: &ModuleId, kind: TransitionKind) -> Option<&PolicyRule> {
        self.rules
            .iter()
            .find(|r| r.kind == kind && r.module.as_ref() == Some(module))
    }

    pub fn billing_period_secs(&self) -> i64 {
        i64::from(self.billing_period_days) * 86_400
    }

    /// Structural checks a document must pass before it can be published
    pub fn validate(&self) -> Result<(), EngineError> {
        let violation = |msg: String| Err(EngineError::PolicyViolation(msg));

        if self.billing_period_days == 0 {
            return violation("billing_period_days must be at least 1".into());
        }
        if self.governance_roles.is_empty() {
            return violation("at least one governance role is required".into());
        }

        let mut seen = BTreeSet::new();
        for module in &self.modules {
            if !seen.insert(&module.id) {
                return violation(format!("module `{}` is declared twice", module.id));
            }
        }
        for module in &self.modules {
            if let Some(missing) = module
                .prerequisites
                .iter()
                .find(|p| self.module(p).is_none())
            {
                return violation(format!(
                    "module `{}` requires unknown module `{missing}`",
                    module.id
                ));
            }
        }

        let mut keys = BTreeSet::new();
        for rule in &self.rules {
            let scope = rule
                .module
                .as_ref()
                .map(ModuleId::as_str)
                .unwrap_or("license");
            if !keys.insert((rule.module.clone(), rule.kind)) {
                return violation(format!("duplicate rule for {scope}/{}", rule.kind));
            }
            if let Some(module) = &rule.module {
                if self.module(module).is_none() {
                    return violation(format!("rule {scope}/{} names unknown module", rule.kind));
                }
            }
            if rule.approving_roles.is_empty() {
                return violation(format!("rule {scope}/{} has no approving role", rule.kind));
            }
            let total_bps: u64 = rule
                .commissions
                .iter()
                .map(|c| u64::from(c.basis_points))
                .sum();
            if total_bps > 10_000 {
                return violation(format!(
                    "rule {scope}/{} splits more than 100% in commissions",
                    rule.kind
                ));
            }
            match &rule.fee {
                FeeFormula::Flat { amount } | FeeFormula::Prorated { period_price: amount }
                    if amount.is_negative() =>
                {
                    return violation(format!("rule {scope}/{} has a negative fee", rule.kind));
                }
                _ => {}
            }
            if rule.escrow_hold.is_some_and(|hold| !hold.is_positive()) {
                return violation(format!(
                    "rule {scope}/{} must hold a positive escrow amount",
                    rule.kind
                ));
            }
            if rule.escrow_hold.is_some() {
                let frozen = self.escrow_during_suspension == EscrowMode::Frozen;
                match rule.kind {
                    TransitionKind::Terminate => {
                        return violation(format!(
                            "rule {scope}/terminate cannot hold escrow on a license that is closing"
                        ));
                    }
                    TransitionKind::Suspend if frozen => {
                        return violation(format!(
                            "rule {scope}/suspend cannot hold escrow while suspension freezes it"
                        ));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

/// One published, immutable version of the policy
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct PolicySet {
    #[n(0)]
    pub version: u64,
    #[n(1)]
    pub published_at: TimeStamp<Utc>,
    #[n(2)]
    pub published_by: Role,
    #[n(3)]
    pub digest: String, // sha256 of the cbor encoded document
    #[n(4)]
    pub document: PolicyDocument,
}

impl std::ops::Deref for PolicySet {
    type Target = PolicyDocument;

    fn deref(&self) -> &Self::Target {
        &self.document
    }
}

pub struct PolicyTable {
    tree: sled::Tree,
    current: RwLock<Arc<PolicySet>>,
}

impl PolicyTable {
    /// Load the latest published version, publishing `bootstrap` as version 1 on an empty store
    pub fn open(db: &sled::Db, bootstrap: Option<PolicyDocument>) -> Result<Self, EngineError> {
        let tree = db.open_tree("policies")?;

        let current = match tree.last()? {
            Some((_, raw)) => {
                let latest: PolicySet = utils::decode(&raw)?;
                if bootstrap.is_some() {
                    tracing::info!(
                        policy_version = latest.version,
                        "policy store already initialised, ignoring bootstrap document"
                    );
                }
                latest
            }
            None => {
                let document = bootstrap.ok_or_else(|| {
                    EngineError::PolicyViolation("no policy has been published".into())
                })?;
                let set = Self::seal(1, Role::from("bootstrap"), document)?;
                tree.insert(set.version.to_be_bytes(), utils::encode(&set)?)?;
                tree.flush()?;
                tracing::info!(policy_version = 1, digest = %set.digest, "bootstrap policy published");
                set
            }
        };

        Ok(Self {
            tree,
            current: RwLock::new(Arc::new(current)),
        })
    }

    fn seal(version: u64, published_by: Role, document: PolicyDocument) -> Result<PolicySet, EngineError> {
        document.validate()?;
        let digest = sha256::digest(&utils::encode(&document)?);

        Ok(PolicySet {
            version,
            published_at: TimeStamp::new(),
            published_by,
            digest,
            document,
        })
    }

    /// Snapshot of the active version. Holders keep it for the whole operation, so a
    /// publish that lands mid-flight does not change the rules they resolve against.
    pub fn current(&self) -> Arc<PolicySet> {
        self.current.read().clone()
    }

    pub fn version(&self, version: u64) -> Result<Option<PolicySet>, EngineError> {
        self.tree
            .get(version.to_be_bytes())?
            .map(|raw| utils::decode(&raw))
            .transpose()
    }

    pub fn versions(&self) -> Result<Vec<u64>, EngineError> {
        self.tree
            .iter()
            .keys()
            .map(|key| {
                let key = key?;
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| EngineError::Corrupt("malformed policy version key".into()))?;
                Ok(u64::from_be_bytes(bytes))
            })
            .collect()
    }

    /// Publish `document` as the next version. Only governance roles of the active version may.
    pub fn publish(&self, role: &Role, document: PolicyDocument) -> Result<Arc<PolicySet>, EngineError> {
        let mut current = self.current.write();
        if !current.governance_roles.contains(role) {
            return Err(EngineError::Unauthorized {
                role: role.clone(),
                action: "publish policy".into(),
            });
        }

        let set = Self::seal(current.version + 1, role.clone(), document)?;
        self.tree
            .insert(set.version.to_be_bytes(), utils::encode(&set)?)?;
        self.tree.flush()?;

        tracing::info!(
            policy_version = set.version,
            published_by = %role,
            digest = %set.digest,
            "policy published"
        );
        let set = Arc::new(set);
        *current = set.clone();

        Ok(set)
    }
}
