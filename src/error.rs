//! Configuration errors raised before any working tree is touched.

use thiserror::Error;

/// A definition that cannot be built as written.
///
/// These are detected while validating the definition and selecting the
/// package manager and generators, so no working directory has been mutated
/// when one is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("couldn't get manager '{0}'")]
    UnknownManager(String),

    #[error("unknown generator '{0}'")]
    UnknownGenerator(String),

    #[error("custom package manager is missing the '{0}' command")]
    IncompleteCustomManager(&'static str),

    #[error("no package manager configured: set packages.manager or packages.custom_manager")]
    MissingManager,

    #[error("package manager '{0}' cannot manage repositories")]
    RepositoriesUnsupported(String),

    #[error("unsupported source type '{0}'")]
    UnsupportedSource(String),

    #[error("invalid definition: {0}")]
    Invalid(String),
}

/// Failures collected while tearing a sandbox down.
///
/// Every teardown step is attempted; this carries the ones that failed.
#[derive(Debug, Default, Error)]
#[error("sandbox teardown incomplete: {}", .failures.join("; "))]
pub struct TeardownErrors {
    pub failures: Vec<String>,
}

impl TeardownErrors {
    pub fn record(&mut self, step: impl std::fmt::Display, err: &anyhow::Error) {
        self.failures.push(format!("{step}: {err:#}"));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<(), TeardownErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}
