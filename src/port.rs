//! The operator-facing side of the maintenance protocols.

use std::path::PathBuf;

use zeroize::Zeroizing;

use crate::crypto::Keyfile;
use crate::error::{Error, Result};
use crate::kdf::Credential;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// The file must already exist.
    Existing,
    /// A file to be created or overwritten.
    New,
}

/// Everything the protocols need from a human operator.
///
/// Prompting methods return [`Error::Cancelled`] when the operator aborts.
pub trait Interaction {
    fn password(&mut self, prompt: &str) -> Result<Zeroizing<Vec<u8>>>;

    fn keyfiles(&mut self) -> Result<Vec<Keyfile>>;

    fn credential(&mut self, prompt: &str) -> Result<Credential> {
        let password = self.password(prompt)?;
        let keyfiles = self.keyfiles()?;
        Ok(Credential::new(password, keyfiles))
    }

    /// Credential for a header about to be created. Ports may ask twice.
    fn new_credential(&mut self) -> Result<Credential> {
        self.credential("New password")
    }

    fn select_file(&mut self, title: &str, mode: FileMode) -> Result<PathBuf>;

    /// `warning` marks a destructive or irreversible step.
    fn confirm(&mut self, message: &str, default: bool, warning: bool) -> Result<bool>;

    /// Single choice; `None` when the operator picks nothing.
    fn choose(&mut self, message: &str, options: &[&str]) -> Result<Option<usize>>;

    fn info(&mut self, message: &str);

    fn warning(&mut self, message: &str);

    fn error(&mut self, message: &str);

    fn begin_busy(&mut self, message: &str);

    fn end_busy(&mut self);

    /// Gives the operator a chance to add randomness before new keys are made.
    fn enrich_entropy(&mut self) -> Result<()> {
        Ok(())
    }

    fn cancelled(&self) -> Error {
        Error::Cancelled
    }
}
