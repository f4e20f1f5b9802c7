//! storyflow: drives stories through an ordered list of pipeline steps,
//! tracking status, history and acceptance in a SQLite or Postgres ledger.

pub mod acceptance;
pub mod config;
pub mod errors;
pub mod fallback;
pub mod handler;
pub mod journal;
pub mod ledger;
pub mod orchestrator;
pub mod steps;

pub use errors::{LedgerError, OrchestratorError};
pub use orchestrator::{Orchestrator, RunOutcome};
