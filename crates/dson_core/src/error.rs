//! Error types and the reporting funnel.
//!
//! Most conditions during an import are recoverable: a missing reference,
//! a duplicate definition, a degenerate bone. They all flow through one
//! funnel parameterized by a severity pair `(warn, raise)` compared
//! against the configured verbosity, so the same condition can be silent,
//! logged, or promoted to a hard error depending on settings. Only I/O
//! failures, unparseable documents, and promoted reports abort an import.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("formula stack error: {0}")]
    FormulaStack(String),

    /// A reported condition promoted to an error by the verbosity level.
    #[error("{0}")]
    Reported(String),
}

/// Severity thresholds `(warn, raise)` for one reportable condition.
///
/// The condition is logged when `verbosity >= warn` and becomes an
/// [`Error::Reported`] when `verbosity >= raise`.
pub type Trigger = (u8, u8);

/// The shared reporting sink for an import session.
#[derive(Debug, Default)]
pub struct Reporter {
    pub verbosity: u8,
    /// Warnings gathered during the import, for the final summary.
    pub collected: Vec<String>,
}

impl Reporter {
    pub fn new(verbosity: u8) -> Self {
        Reporter {
            verbosity,
            collected: Vec::new(),
        }
    }

    /// Report a condition against the active verbosity.
    pub fn report(&mut self, msg: impl Into<String>, trigger: Trigger) -> Result<()> {
        let (warn, raise) = trigger;
        let msg = msg.into();
        if self.verbosity >= raise {
            log::error!("{msg}");
            self.collected.push(msg.clone());
            return Err(Error::Reported(msg));
        }
        if self.verbosity >= warn {
            log::warn!("{msg}");
            self.collected.push(msg);
        }
        Ok(())
    }
}
