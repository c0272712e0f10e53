//! # licensectl
//!
//! Operator CLI over a license ledger database. Every subcommand opens the sled
//! database named by the config (or `--db`), runs one engine operation and prints
//! the result.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use license_ledger::config::EngineConfig;
use license_ledger::ledger::EntryKind;
use license_ledger::{Amount, HolderId, LicenseId, LicensingEngine, ModuleId, Receipt, Role};

#[derive(Parser, Debug)]
#[command(name = "licensectl", version, about = "Inspect and mutate licenses in a license ledger")]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database directory, overriding `storage.path` from the config.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct LicenseArgs {
    license_id: String,
    /// Role requesting the transition.
    #[arg(long)]
    role: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue a new license, or only store it as a draft.
    Issue {
        #[arg(long)]
        holder: String,
        /// Module to license; repeat for several.
        #[arg(long = "module", required = true)]
        modules: Vec<String>,
        #[arg(long)]
        role: String,
        /// Store a draft instead of issuing.
        #[arg(long)]
        draft: bool,
    },
    /// Issue a previously stored draft.
    IssueDraft(LicenseArgs),
    /// Add or remove modules on an active license.
    Change {
        #[command(flatten)]
        license: LicenseArgs,
        #[arg(long)]
        add: Vec<String>,
        #[arg(long)]
        remove: Vec<String>,
        /// Only apply if the license is still at this transition.
        #[arg(long)]
        expect: Option<u64>,
    },
    Suspend(LicenseArgs),
    Reinstate(LicenseArgs),
    Terminate(LicenseArgs),
    /// Record a standalone ledger event.
    Charge {
        license_id: String,
        #[arg(long, default_value = "fee")]
        kind: EntryKind,
        /// Decimal amount from the holder's perspective, e.g. -12.50 for a charge.
        #[arg(long, allow_hyphen_values = true)]
        amount: Amount,
        #[arg(long, default_value = "platform")]
        counterparty: String,
    },
    /// Show the running balance, the replayed balance and held escrow.
    Balance {
        license_id: String,
        /// Also list every entry.
        #[arg(long)]
        entries: bool,
    },
    /// Print the transition history and check it replays to the stored snapshot.
    History { license_id: String },
    /// List the operations a role may exercise under a license.
    Resolve {
        license_id: String,
        #[arg(long)]
        role: String,
    },
    /// Deliver commission credits still waiting in the outbox.
    Deliver,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match EngineConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}: {e}", path.display());
                return ExitCode::from(2);
            }
        },
        None => EngineConfig::default(),
    };

    let filter = match cli.verbose {
        0 => EnvFilter::try_new(&config.logging.filter).unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli, config: EngineConfig) -> anyhow::Result<()> {
    let path = cli.db.unwrap_or_else(|| config.storage.path.clone());
    let db = sled::open(&path).with_context(|| format!("opening database at {}", path.display()))?;
    let engine = LicensingEngine::open(Arc::new(db), config.settings(), config.policy.clone())
        .context("opening licensing engine")?;
    tracing::debug!(db = %path.display(), policy_version = engine.policies().current().version, "engine ready");

    match cli.command {
        Commands::Issue {
            holder,
            modules,
            role,
            draft,
        } => {
            let modules = module_set(modules);
            if draft {
                let license = engine.draft(HolderId::new(holder), modules, &Role::new(role))?;
                println!("drafted {}", license.license_id());
            } else {
                print_receipt(&engine.issue(HolderId::new(holder), modules, &Role::new(role))?);
            }
        }
        Commands::IssueDraft(args) => {
            print_receipt(&engine.issue_draft(&LicenseId::new(args.license_id), &Role::new(args.role))?)
        }
        Commands::Change {
            license,
            add,
            remove,
            expect,
        } => {
            let id = LicenseId::new(license.license_id);
            let role = Role::new(license.role);
            let receipt = match expect {
                Some(expected) => {
                    engine.change_modules_if(&id, expected, module_set(add), module_set(remove), &role)?
                }
                None => engine.change_modules(&id, module_set(add), module_set(remove), &role)?,
            };
            print_receipt(&receipt);
        }
        Commands::Suspend(args) => {
            print_receipt(&engine.suspend(&LicenseId::new(args.license_id), &Role::new(args.role))?)
        }
        Commands::Reinstate(args) => {
            print_receipt(&engine.reinstate(&LicenseId::new(args.license_id), &Role::new(args.role))?)
        }
        Commands::Terminate(args) => {
            print_receipt(&engine.terminate(&LicenseId::new(args.license_id), &Role::new(args.role))?)
        }
        Commands::Charge {
            license_id,
            kind,
            amount,
            counterparty,
        } => {
            let entry = engine.record_transaction(&LicenseId::new(license_id), kind, amount, &counterparty)?;
            println!(
                "entry #{} {} {} with {}",
                entry.entry_id, entry.kind, entry.amount, entry.counterparty_id
            );
        }
        Commands::Balance {
            license_id,
            entries,
        } => {
            let id = LicenseId::new(license_id);
            println!("balance   {}", engine.balance_of(&id)?);
            println!("replayed  {}", engine.replay_balance(&id)?);
            println!("escrow    {}", engine.escrow_held(&id)?);
            if entries {
                for entry in engine.entries(&id)? {
                    let cause = entry
                        .causing_transition
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "  #{:<4} {:<15} {:>12} {:<12} policy v{} cause {} at {}",
                        entry.entry_id,
                        entry.kind.to_string(),
                        entry.amount.to_string(),
                        entry.counterparty_id,
                        entry.policy_version,
                        cause,
                        entry.timestamp
                    );
                }
            }
        }
        Commands::History { license_id } => {
            let id = LicenseId::new(license_id);
            let license = engine.rebuild(&id)?;
            print!("{}", license.view_history(&engine.history(&id)?));
            println!(
                "state {} modules [{}]",
                license.state(),
                join(license.module_set().iter().map(ModuleId::as_str))
            );
        }
        Commands::Resolve { license_id, role } => {
            let id = LicenseId::new(license_id);
            let role = Role::new(role);
            let capabilities = engine.resolve(&id, &role)?;
            println!(
                "visible modules: [{}]",
                join(engine.visible_modules(&id, &role)?.iter().map(ModuleId::as_str))
            );
            for capability in capabilities {
                println!("  {capability}");
            }
        }
        Commands::Deliver => {
            println!("delivered {} credit(s)", engine.deliver_pending_credits()?);
        }
    }

    Ok(())
}

fn module_set(names: Vec<String>) -> BTreeSet<ModuleId> {
    names.into_iter().map(ModuleId::new).collect()
}

fn join<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.collect::<Vec<_>>().join(", ")
}

fn print_receipt(receipt: &Receipt) {
    let record = &receipt.transition;
    println!(
        "{} #{} {} -> {} (policy v{})",
        receipt.license.license_id(),
        record.transition_id,
        record.from,
        record.to,
        record.policy_version
    );
    for entry in &receipt.entries {
        println!("  {:<15} {:>12} {}", entry.kind.to_string(), entry.amount.to_string(), entry.counterparty_id);
    }
    if receipt.credits_delivered > 0 {
        println!("  {} commission credit(s) delivered", receipt.credits_delivered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_issue_with_repeated_modules() {
        let cli = Cli::try_parse_from([
            "licensectl", "issue", "--holder", "acme", "--module", "inventory", "--module", "orders",
            "--role", "governor",
        ])
        .unwrap();
        match cli.command {
            Commands::Issue { modules, draft, .. } => {
                assert_eq!(modules, vec!["inventory", "orders"]);
                assert!(!draft);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_negative_charge_amount() {
        let cli = Cli::try_parse_from([
            "licensectl", "charge", "lic1abc", "--amount", "-12.50", "--kind", "fee",
        ])
        .unwrap();
        match cli.command {
            Commands::Charge { amount, kind, counterparty, .. } => {
                assert_eq!(amount, Amount::from_minor(-1250));
                assert_eq!(kind, EntryKind::Fee);
                assert_eq!(counterparty, "platform");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_amount_with_too_many_decimals() {
        assert!(Cli::try_parse_from(["licensectl", "charge", "lic1abc", "--amount", "1.005"]).is_err());
    }

    #[test]
    fn parses_conditioned_change() {
        let cli = Cli::try_parse_from([
            "licensectl", "change", "lic1abc", "--role", "governor", "--add", "analytics", "--expect", "3",
        ])
        .unwrap();
        match cli.command {
            Commands::Change { license, add, remove, expect } => {
                assert_eq!(license.license_id, "lic1abc");
                assert_eq!(add, vec!["analytics"]);
                assert!(remove.is_empty());
                assert_eq!(expect, Some(3));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
