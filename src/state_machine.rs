//! License state machine: decides whether a transition may happen and what it costs
//!
//! [`attempt_transition`] is pure. It never touches storage; the caller commits the
//! returned snapshot, record and ledger effects together or not at all.
use std::collections::BTreeSet;

use chrono::Utc;

use crate::error::EngineError;
use crate::ledger::{EntryKind, NewEntry};
use crate::license::{License, LicenseState, TransitionKind, TransitionRecord};
use crate::policy::{FeeFormula, PolicyRule, PolicySet};
use crate::types::{Amount, LicenseId, ModuleId, Role, TimeStamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionPayload {
    None,
    Modules {
        add: BTreeSet<ModuleId>,
        remove: BTreeSet<ModuleId>,
    },
}

#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub kind: TransitionKind,
    pub role: Role,
    pub payload: TransitionPayload,
}

impl TransitionRequest {
    pub fn new(kind: TransitionKind, role: Role) -> Self {
        Self {
            kind,
            role,
            payload: TransitionPayload::None,
        }
    }

    /// Upgrade when anything is added, downgrade when modules are only removed
    pub fn change_modules(role: Role, add: BTreeSet<ModuleId>, remove: BTreeSet<ModuleId>) -> Self {
        let kind = if add.is_empty() {
            TransitionKind::Downgrade
        } else {
            TransitionKind::Upgrade
        };
        Self {
            kind,
            role,
            payload: TransitionPayload::Modules { add, remove },
        }
    }
}

/// Inputs from outside the license that a transition depends on
pub struct TransitionContext<'a> {
    pub policy: &'a PolicySet,
    pub now: TimeStamp<Utc>,
    pub escrow_held: Amount,
}

/// A credit owed to another license, delivered as that license's own append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCredit {
    pub beneficiary: LicenseId,
    pub entry: NewEntry,
}

#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub license: License,
    pub record: TransitionRecord,
    pub entries: Vec<NewEntry>,
    pub credits: Vec<PendingCredit>,
}

pub fn attempt_transition(
    license: &License,
    request: &TransitionRequest,
    ctx: &TransitionContext<'_>,
) -> Result<TransitionOutcome, EngineError> {
    let kind = request.kind;
    let from = license.state();
    let to = kind
        .target(from)
        .ok_or(EngineError::InvalidTransition { from, kind })?;

    let (added, removed) = requested_delta(license, request)?;
    check_catalogue(ctx.policy, &added)?;

    // rules apply to the modules the transition touches; lifecycle moves touch all held modules
    let affected: BTreeSet<ModuleId> = match kind {
        TransitionKind::Issue => added.clone(),
        TransitionKind::Upgrade | TransitionKind::Downgrade => {
            added.union(&removed).cloned().collect()
        }
        TransitionKind::Suspend | TransitionKind::Reinstate | TransitionKind::Terminate => {
            license.module_set().clone()
        }
    };
    let rules = applicable_rules(ctx.policy, kind, &affected)?;
    if let Some(rule) = rules.iter().find(|rule| !rule.approves(&request.role)) {
        let scope = rule
            .module
            .as_ref()
            .map(|m| format!(" module {m}"))
            .unwrap_or_default();
        return Err(EngineError::Unauthorized {
            role: request.role.clone(),
            action: format!("{kind}{scope} on license {}", license.license_id()),
        });
    }

    check_delta(license, kind, &added, &removed)?;
    let mut resulting: BTreeSet<ModuleId> = license.module_set().union(&added).cloned().collect();
    resulting.retain(|m| !removed.contains(m));
    check_module_set(ctx.policy, to, &resulting)?;

    let record = TransitionRecord {
        transition_id: license.last_transition_id() + 1,
        kind,
        from,
        to,
        requesting_role: request.role.clone(),
        policy_version: ctx.policy.version,
        at: ctx.now.clone(),
        modules_added: added,
        modules_removed: removed,
    };

    let mut next = license.clone();
    next.apply(&record)?;

    let (entries, credits) = ledger_effects(license, kind, &rules, ctx)?;

    Ok(TransitionOutcome {
        license: next,
        record,
        entries,
        credits,
    })
}

/// Modules the request names, checked for shape only. Whether they fit the license is
/// checked by [`check_delta`], after approval.
fn requested_delta(
    license: &License,
    request: &TransitionRequest,
) -> Result<(BTreeSet<ModuleId>, BTreeSet<ModuleId>), EngineError> {
    match (request.kind, &request.payload) {
        (TransitionKind::Issue, _) => Ok((license.module_set().clone(), BTreeSet::new())),
        (TransitionKind::Terminate, _) => Ok((BTreeSet::new(), license.module_set().clone())),
        (TransitionKind::Upgrade | TransitionKind::Downgrade, TransitionPayload::Modules { add, remove }) => {
            if add.is_empty() && remove.is_empty() {
                return Err(EngineError::PolicyViolation(
                    "a module change must add or remove at least one module".into(),
                ));
            }
            if request.kind == TransitionKind::Upgrade && add.is_empty() {
                return Err(EngineError::PolicyViolation("an upgrade must add a module".into()));
            }
            if request.kind == TransitionKind::Downgrade && !add.is_empty() {
                return Err(EngineError::PolicyViolation("a downgrade cannot add modules".into()));
            }
            Ok((add.clone(), remove.clone()))
        }
        (TransitionKind::Upgrade | TransitionKind::Downgrade, TransitionPayload::None) => Err(
            EngineError::PolicyViolation(format!("{} requires a module change", request.kind)),
        ),
        _ => Ok((BTreeSet::new(), BTreeSet::new())),
    }
}

fn check_delta(
    license: &License,
    kind: TransitionKind,
    added: &BTreeSet<ModuleId>,
    removed: &BTreeSet<ModuleId>,
) -> Result<(), EngineError> {
    if !matches!(kind, TransitionKind::Upgrade | TransitionKind::Downgrade) {
        return Ok(());
    }
    if let Some(both) = added.intersection(removed).next() {
        return Err(EngineError::InvalidModuleSet(format!(
            "module `{both}` is both added and removed"
        )));
    }
    if let Some(held) = added.iter().find(|m| license.holds(m)) {
        return Err(EngineError::InvalidModuleSet(format!(
            "module `{held}` is already licensed"
        )));
    }
    if let Some(missing) = removed.iter().find(|m| !license.holds(m)) {
        return Err(EngineError::InvalidModuleSet(format!(
            "module `{missing}` is not licensed"
        )));
    }
    Ok(())
}

fn check_catalogue(policy: &PolicySet, added: &BTreeSet<ModuleId>) -> Result<(), EngineError> {
    for module in added {
        match policy.module(module) {
            None => {
                return Err(EngineError::PolicyViolation(format!(
                    "module `{module}` is not in the catalogue of policy v{}",
                    policy.version
                )));
            }
            Some(spec) if !spec.licensable => {
                return Err(EngineError::PolicyViolation(format!(
                    "module `{module}` is not licensable under policy v{}",
                    policy.version
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn applicable_rules<'p>(
    policy: &'p PolicySet,
    kind: TransitionKind,
    affected: &BTreeSet<ModuleId>,
) -> Result<Vec<&'p PolicyRule>, EngineError> {
    let rules: Vec<&PolicyRule> = policy
        .license_rule(kind)
        .into_iter()
        .chain(affected.iter().filter_map(|m| policy.module_rule(m, kind)))
        .collect();

    if rules.is_empty() {
        return Err(EngineError::PolicyViolation(format!(
            "no rule of policy v{} governs `{kind}`",
            policy.version
        )));
    }
    Ok(rules)
}

fn check_module_set(
    policy: &PolicySet,
    to: LicenseState,
    modules: &BTreeSet<ModuleId>,
) -> Result<(), EngineError> {
    if to.is_terminal() {
        return Ok(());
    }
    if modules.is_empty() {
        return Err(EngineError::InvalidModuleSet(format!(
            "a {to} license must hold at least one module"
        )));
    }
    for module in modules {
        let Some(spec) = policy.module(module) else {
            // held from an older policy version; it keeps its grant until removed
            continue;
        };
        if let Some(missing) = spec.prerequisites.iter().find(|p| !modules.contains(*p)) {
            return Err(EngineError::InvalidModuleSet(format!(
                "module `{module}` requires `{missing}`"
            )));
        }
    }
    Ok(())
}

/// Seconds left in the billing period `now` falls in, counted from the issue date
fn remaining_in_period(license: &License, ctx: &TransitionContext<'_>) -> (i64, i64) {
    let period = ctx.policy.billing_period_secs();
    let anchor = if license.last_transition_id() == 0 {
        &ctx.now
    } else {
        license.issued_at().unwrap_or(&ctx.now)
    };
    let elapsed = ctx.now.seconds_since(anchor).max(0);
    (period - elapsed % period, period)
}

fn ledger_effects(
    license: &License,
    kind: TransitionKind,
    rules: &[&PolicyRule],
    ctx: &TransitionContext<'_>,
) -> Result<(Vec<NewEntry>, Vec<PendingCredit>), EngineError> {
    let overflow = || EngineError::PolicyViolation("fee computation overflows".into());
    let platform = ctx.policy.platform_account.as_str();
    let holder = license.holder_id().as_str();
    let credits_unused_time = matches!(
        kind,
        TransitionKind::Downgrade | TransitionKind::Suspend | TransitionKind::Terminate
    );

    let mut entries = Vec::new();
    let mut credits = Vec::new();
    let mut held = ctx.escrow_held;

    for rule in rules {
        let entry = match &rule.fee {
            FeeFormula::None => None,
            FeeFormula::Flat { amount } => Some(NewEntry::new(
                EntryKind::Fee,
                amount.checked_neg().ok_or_else(overflow)?,
                platform,
            )),
            FeeFormula::Prorated { period_price } => {
                let (remaining, period) = remaining_in_period(license, ctx);
                let share = period_price.prorate(remaining, period).ok_or_else(overflow)?;
                if credits_unused_time {
                    Some(NewEntry::new(EntryKind::Refund, share, platform))
                } else {
                    Some(NewEntry::new(
                        EntryKind::Fee,
                        share.checked_neg().ok_or_else(overflow)?,
                        platform,
                    ))
                }
            }
        };

        if let Some(entry) = entry.filter(|e| !e.amount.is_zero()) {
            if entry.kind == EntryKind::Fee {
                for split in &rule.commissions {
                    let share = entry.amount.abs().basis_points(split.basis_points).ok_or_else(overflow)?;
                    if share.is_zero() {
                        continue;
                    }
                    credits.push(PendingCredit {
                        beneficiary: split.beneficiary.clone(),
                        entry: NewEntry::new(EntryKind::Commission, share, holder),
                    });
                }
            }
            entries.push(entry);
        }

        if let Some(hold) = rule.escrow_hold {
            let hold = hold.abs();
            held = held.checked_add(hold).ok_or_else(overflow)?;
            entries.push(NewEntry::new(
                EntryKind::EscrowHold,
                hold.checked_neg().ok_or_else(overflow)?,
                platform,
            ));
        }
    }

    // includes holds taken by this transition
    if kind == TransitionKind::Terminate && held.is_positive() {
        entries.push(NewEntry::new(EntryKind::EscrowRelease, held, holder));
    }

    // every transition leaves at least one entry so the ledger doubles as the audit trail
    if entries.is_empty() {
        entries.push(NewEntry::new(EntryKind::Fee, Amount::ZERO, platform));
    }

    Ok((entries, credits))
}
