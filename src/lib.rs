pub mod clock;
pub mod config;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod ledger;
pub mod license;
pub mod locks;
pub mod policy;
pub mod repository;
pub mod retry;
pub mod state_machine;
pub mod types;
pub mod utils;

pub use engine::{EngineSettings, LicensingEngine, Receipt};
pub use error::{ConfigError, EngineError};
pub use types::{Amount, HolderId, LicenseId, ModuleId, Role, TimeStamp};
