use thiserror::Error;

/// Core error types for the enforcement engine
///
/// Nothing here is fatal to the process: every failure is reported to its
/// caller (CLI layer, background loop, or the engine's own compensation
/// logic) and the process keeps running.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// nft command execution failed (non-zero exit, timeout, missing binary)
    #[error("nftables error: {message}")]
    Nft {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Mode string from configuration or CLI was not recognized
    #[error("unsupported firewall mode: {0} (expected 'blacklist' or 'whitelist')")]
    UnsupportedMode(String),

    /// Policy store operation failed
    #[error("policy store error: {0}")]
    Storage(String),

    /// A required table/chain/set could not be created
    #[error("infrastructure bootstrap failed: {0}")]
    Bootstrap(String),

    /// Rule could not be located in the live chain, by handle or by content
    #[error("rule not found in live chain: {0}")]
    RuleNotFound(String),

    /// update() deleted the old rule, failed to add the new one, and then
    /// failed to restore the old one. The live chain is now missing a rule
    /// the store expects to have; surfaced distinctly so callers know.
    #[error("compensation failed after update of rule '{rule}': {source}")]
    Compensation {
        rule: String,
        #[source]
        source: Box<Error>,
    },

    /// A full chain re-sync re-added only part of the rule set
    #[error("partial re-sync: {succeeded}/{attempted} rules re-added")]
    PartialResync { succeeded: usize, attempted: usize },

    /// Input validation failed
    #[error("validation error in {field}: {message}")]
    Validation { field: String, message: String },
}

impl Error {
    /// Builds an [`Error::Nft`] from a captured command output.
    pub fn from_output(context: &str, output: &crate::core::nft::CmdOutput) -> Self {
        let first_line = output
            .stderr
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("command failed")
            .trim()
            .to_string();
        Error::Nft {
            message: format!("{context}: {first_line}"),
            stderr: Some(output.stderr.clone()),
            exit_code: output.code,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
