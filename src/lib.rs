//! corrector: a correction job pipeline.
//!
//! Work items flow Pending → Processing → a terminal status through the
//! [`store`]. Periodic lanes claim them, the [`escalation`] executor walks a
//! cost-ordered chain of model tiers until the [`validator`] accepts an
//! answer, and [`maintenance`] recovers whatever a crash leaves behind.

pub mod admin;
pub mod anthropic;
pub mod backlog;
pub mod clock;
pub mod config;
pub mod error;
pub mod escalation;
pub mod maintenance;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod subjects;
pub mod telemetry;
pub mod validator;

pub use error::CorrectorError;
