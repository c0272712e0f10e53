#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use license_ledger::clock::Clock;
use license_ledger::license::TransitionKind;
use license_ledger::locks::LockMode;
use license_ledger::policy::{FeeFormula, ModuleSpec, OperationSpec, PolicyDocument, PolicyRule, RoleGrant};
use license_ledger::retry::RetryPolicy;
use license_ledger::{Amount, EngineSettings, LicensingEngine, ModuleId, Role};
use tempfile::TempDir;

pub fn modules(names: &[&str]) -> BTreeSet<ModuleId> {
    names.iter().map(|n| ModuleId::from(*n)).collect()
}

pub fn role(name: &str) -> Role {
    Role::from(name)
}

fn module(id: &str, prerequisites: &[&str], operations: &[(&str, bool)]) -> ModuleSpec {
    ModuleSpec {
        id: ModuleId::from(id),
        licensable: id != "internal",
        prerequisites: modules(prerequisites),
        operations: operations
            .iter()
            .map(|(op, read_only)| OperationSpec {
                id: op.to_string(),
                read_only: *read_only,
            })
            .collect(),
    }
}

fn grant(name: &str, level: u8, operations: &[&str]) -> RoleGrant {
    RoleGrant {
        role: role(name),
        level,
        operations: operations.iter().map(|o| o.to_string()).collect(),
    }
}

pub fn rule(module: Option<&str>, kind: TransitionKind, fee: FeeFormula) -> PolicyRule {
    PolicyRule {
        module: module.map(ModuleId::from),
        kind,
        approving_roles: [role("governor"), role("emperor")].into(),
        fee,
        commissions: vec![],
        escrow_hold: None,
    }
}

/// Four modules, the viewer/operator/governor/emperor ladder, a flat 100.00 issuance
/// fee and analytics billed at 30.00 per 30 day period.
pub fn fixture_policy() -> PolicyDocument {
    let mut rules: Vec<PolicyRule> = TransitionKind::ALL
        .iter()
        .map(|kind| rule(None, *kind, FeeFormula::None))
        .collect();
    rules[0].fee = FeeFormula::Flat {
        amount: Amount::units(100),
    };
    for kind in [TransitionKind::Upgrade, TransitionKind::Downgrade] {
        rules.push(rule(
            Some("analytics"),
            kind,
            FeeFormula::Prorated {
                period_price: Amount::units(30),
            },
        ));
    }

    PolicyDocument {
        platform_account: "platform".into(),
        billing_period_days: 30,
        escrow_during_suspension: Default::default(),
        governance_roles: [role("emperor")].into(),
        modules: vec![
            module("inventory", &[], &[("view", true), ("adjust", false)]),
            module("orders", &["inventory"], &[("view", true), ("create", false)]),
            module("analytics", &[], &[("view", true), ("export", false)]),
            module("internal", &[], &[("debug", false)]),
        ],
        roles: vec![
            grant("viewer", 1, &["view"]),
            grant("operator", 2, &["view", "inventory:adjust", "orders:create"]),
            grant("governor", 3, &["*"]),
            grant("emperor", 4, &["*"]),
        ],
        rules,
    }
}

pub fn fast_settings(lock_mode: LockMode) -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            write_timeout: Duration::from_millis(500),
        },
        lock_mode,
        flush_on_commit: false,
    }
}

pub fn open_db(dir: &TempDir, name: &str) -> anyhow::Result<Arc<sled::Db>> {
    Ok(Arc::new(sled::open(dir.path().join(name))?))
}

pub fn open_engine(dir: &TempDir, name: &str) -> anyhow::Result<LicensingEngine> {
    Ok(LicensingEngine::open(
        open_db(dir, name)?,
        fast_settings(LockMode::Wait(Duration::from_secs(5))),
        Some(fixture_policy()),
    )?)
}

pub fn open_engine_with_clock(
    dir: &TempDir,
    name: &str,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<LicensingEngine> {
    Ok(LicensingEngine::with_clock(
        open_db(dir, name)?,
        fast_settings(LockMode::Wait(Duration::from_secs(5))),
        Some(fixture_policy()),
        clock,
    )?)
}
