//! Entitlement resolution: which operations a role may exercise under a license right now
use std::collections::BTreeSet;

use dashmap::DashMap;

use crate::license::{License, LicenseState};
use crate::policy::PolicySet;
use crate::types::{LicenseId, ModuleId, Role};

/// Granted operations as `module:operation` ids
pub type CapabilitySet = BTreeSet<String>;

pub fn capability_id(module: &ModuleId, operation: &str) -> String {
    format!("{}:{}", module.as_str(), operation)
}

/// Pure resolution against one policy version. Modules held under an older policy
/// version and missing from this catalogue grant nothing.
pub fn resolve(license: &License, role: &Role, policy: &PolicySet) -> CapabilitySet {
    let read_only = match license.state() {
        LicenseState::Draft | LicenseState::Terminated => return CapabilitySet::new(),
        LicenseState::Suspended => true,
        LicenseState::Active => false,
    };
    let Some(grant) = policy.role(role) else {
        return CapabilitySet::new();
    };

    license
        .module_set()
        .iter()
        .filter_map(|module| policy.module(module))
        .flat_map(|spec| {
            spec.operations
                .iter()
                .filter(move |op| !read_only || op.read_only)
                .filter(move |op| grant.permits(&spec.id, &op.id))
                .map(move |op| capability_id(&spec.id, &op.id))
        })
        .collect()
}

/// Modules a presentation layer should show for a resolved capability set
pub fn visible_modules(capabilities: &CapabilitySet) -> BTreeSet<ModuleId> {
    capabilities
        .iter()
        .filter_map(|cap| cap.split_once(':'))
        .map(|(module, _)| ModuleId::from(module))
        .collect()
}

#[derive(Debug, Clone)]
struct CachedGrant {
    transition_id: u64,
    policy_version: u64,
    capabilities: CapabilitySet,
}

/// Memoises [`resolve`] per `(license, role)`. An entry is only served while both the
/// license's last transition and the policy version it was computed under still match.
#[derive(Default)]
pub struct EntitlementResolver {
    cache: DashMap<(LicenseId, Role), CachedGrant>,
}

impl EntitlementResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_cached(&self, license: &License, role: &Role, policy: &PolicySet) -> CapabilitySet {
        let key = (license.license_id().clone(), role.clone());

        if let Some(hit) = self.cache.get(&key) {
            if hit.transition_id == license.last_transition_id() && hit.policy_version == policy.version {
                tracing::debug!(license_id = %license.license_id(), %role, "entitlement cache hit");
                return hit.capabilities.clone();
            }
        }

        tracing::debug!(
            license_id = %license.license_id(),
            %role,
            policy_version = policy.version,
            "entitlement cache miss"
        );
        let capabilities = resolve(license, role, policy);
        self.cache.insert(
            key,
            CachedGrant {
                transition_id: license.last_transition_id(),
                policy_version: policy.version,
                capabilities: capabilities.clone(),
            },
        );
        capabilities
    }

    pub fn invalidate(&self, license_id: &LicenseId) {
        self.cache.retain(|(id, _), _| id != license_id);
    }

    pub fn invalidate_all(&self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::{TransitionKind, TransitionRecord};
    use crate::policy::{EscrowMode, ModuleSpec, OperationSpec, PolicyDocument, RoleGrant};
    use crate::types::{HolderId, TimeStamp};

    fn op(id: &str, read_only: bool) -> OperationSpec {
        OperationSpec {
            id: id.into(),
            read_only,
        }
    }

    fn grant(role: &str, ops: &[&str]) -> RoleGrant {
        RoleGrant {
            role: Role::from(role),
            level: 1,
            operations: ops.iter().map(|o| o.to_string()).collect(),
        }
    }

    fn policy(version: u64) -> PolicySet {
        PolicySet {
            version,
            published_at: TimeStamp::new(),
            published_by: Role::from("emperor"),
            digest: String::new(),
            document: PolicyDocument {
                platform_account: "platform".into(),
                billing_period_days: 30,
                escrow_during_suspension: EscrowMode::Frozen,
                governance_roles: [Role::from("emperor")].into(),
                modules: vec![
                    ModuleSpec {
                        id: ModuleId::from("inventory"),
                        licensable: true,
                        prerequisites: BTreeSet::new(),
                        operations: vec![op("view", true), op("adjust", false)],
                    },
                    ModuleSpec {
                        id: ModuleId::from("orders"),
                        licensable: true,
                        prerequisites: BTreeSet::new(),
                        operations: vec![op("view", true), op("create", false)],
                    },
                ],
                roles: vec![
                    grant("viewer", &["view"]),
                    grant("operator", &["view", "inventory:adjust"]),
                    grant("emperor", &["*"]),
                ],
                rules: vec![],
            },
        }
    }

    fn license_in(state: LicenseState) -> License {
        let mut license = License::draft(
            LicenseId::from("lic1ent"),
            HolderId::from("acme"),
            ["inventory", "orders"].into_iter().map(ModuleId::from).collect(),
            TimeStamp::new(),
        );
        let path: &[TransitionKind] = match state {
            LicenseState::Draft => &[],
            LicenseState::Active => &[TransitionKind::Issue],
            LicenseState::Suspended => &[TransitionKind::Issue, TransitionKind::Suspend],
            LicenseState::Terminated => &[TransitionKind::Issue, TransitionKind::Terminate],
        };
        for kind in path {
            let from = license.state();
            let record = TransitionRecord {
                transition_id: license.last_transition_id() + 1,
                kind: *kind,
                from,
                to: kind.target(from).unwrap(),
                requesting_role: Role::from("governor"),
                policy_version: 1,
                at: TimeStamp::new(),
                modules_added: BTreeSet::new(),
                modules_removed: if *kind == TransitionKind::Terminate {
                    license.module_set().clone()
                } else {
                    BTreeSet::new()
                },
            };
            license.apply(&record).unwrap();
        }
        license
    }

    fn caps(ids: &[&str]) -> CapabilitySet {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn active_license_grants_by_role() {
        let policy = policy(1);
        let license = license_in(LicenseState::Active);

        assert_eq!(
            resolve(&license, &Role::from("viewer"), &policy),
            caps(&["inventory:view", "orders:view"])
        );
        assert_eq!(
            resolve(&license, &Role::from("operator"), &policy),
            caps(&["inventory:adjust", "inventory:view", "orders:view"])
        );
        assert_eq!(resolve(&license, &Role::from("emperor"), &policy).len(), 4);
        assert!(resolve(&license, &Role::from("stranger"), &policy).is_empty());
    }

    #[test]
    fn suspended_license_keeps_read_only_operations() {
        let policy = policy(1);
        let license = license_in(LicenseState::Suspended);
        assert_eq!(
            resolve(&license, &Role::from("emperor"), &policy),
            caps(&["inventory:view", "orders:view"])
        );
    }

    #[test]
    fn draft_and_terminated_grant_nothing() {
        let policy = policy(1);
        for state in [LicenseState::Draft, LicenseState::Terminated] {
            let license = license_in(state);
            assert!(resolve(&license, &Role::from("emperor"), &policy).is_empty());
        }
    }

    #[test]
    fn visibility_projects_modules() {
        let visible = visible_modules(&caps(&["inventory:view", "inventory:adjust", "orders:view"]));
        assert_eq!(
            visible,
            ["inventory", "orders"].into_iter().map(ModuleId::from).collect()
        );
    }

    #[test]
    fn cache_is_bypassed_when_stamps_change() {
        let resolver = EntitlementResolver::new();
        let license = license_in(LicenseState::Active);
        let role = Role::from("emperor");

        let first = resolver.resolve_cached(&license, &role, &policy(1));
        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.resolve_cached(&license, &role, &policy(1)), first);

        // a newer policy where the role sees nothing: the stale entry must not be served
        let mut stricter = policy(2);
        stricter.document.roles.clear();
        assert!(resolver.resolve_cached(&license, &role, &stricter).is_empty());

        let suspended = license_in(LicenseState::Suspended);
        assert_eq!(
            resolver.resolve_cached(&suspended, &role, &policy(2)),
            caps(&["inventory:view", "orders:view"])
        );

        resolver.invalidate(license.license_id());
        assert!(resolver.is_empty());
    }
}
