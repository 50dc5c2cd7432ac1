//! Decides whether the process on the other end of the socket was signed
//! with the same certificate chain as this process.

use std::fmt::{Display, Formatter};

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::SecurityCodeSigning;

/// DER encoded certificate as handed out by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Certificate(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodesignError {
    CodeSignNotMatched,
    CodeSignCheckFailed(String),
}

impl Display for CodesignError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CodesignError::CodeSignNotMatched => write!(f, "Code signature does not match"),
            CodesignError::CodeSignCheckFailed(reason) => {
                write!(f, "Code signature check failed: {}", reason)
            }
        }
    }
}

impl std::error::Error for CodesignError {}

pub trait CodeSigning: Send + Sync + 'static {
    fn certificates_for_self(&self) -> Result<Vec<Certificate>, CodesignError>;

    /// Validates the static code of `pid` before reading its chain.
    fn certificates_for_pid(&self, pid: i32) -> Result<Vec<Certificate>, CodesignError>;
}

/// Accepts the peer only if both chains are equal, element by element and in order.
pub fn check_peer<C: CodeSigning + ?Sized>(signing: &C, pid: Option<i32>) -> Result<(), CodesignError> {
    let Some(pid) = pid else {
        return Err(CodesignError::CodeSignCheckFailed(
            "peer pid not available".to_string(),
        ));
    };

    let own = signing.certificates_for_self()?;
    if own.is_empty() {
        return Err(CodesignError::CodeSignCheckFailed(
            "own code carries no certificates".to_string(),
        ));
    }

    let peer = signing.certificates_for_pid(pid)?;

    if own != peer {
        tracing::warn!(pid, own = own.len(), peer = peer.len(), "certificate chain mismatch");
        return Err(CodesignError::CodeSignNotMatched);
    }

    Ok(())
}
