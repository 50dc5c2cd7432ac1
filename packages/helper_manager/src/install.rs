use std::fmt::{Display, Formatter};

/// Error codes reported by `SMJobBless`, see `ServiceManagement/SMErrors.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlessErrorCode {
    InternalFailure,
    InvalidSignature,
    AuthorizationFailure,
    ToolNotValid,
    JobNotFound,
    ServiceUnavailable,
    JobPlistNotFound,
    JobMustBeEnabled,
    InvalidPlist,
    LaunchDeniedByUser,
    AlreadyRegistered,
    Unknown(i64),
}

impl From<i64> for BlessErrorCode {
    fn from(code: i64) -> Self {
        match code {
            2 => BlessErrorCode::InternalFailure,
            3 => BlessErrorCode::InvalidSignature,
            4 => BlessErrorCode::AuthorizationFailure,
            5 => BlessErrorCode::ToolNotValid,
            6 => BlessErrorCode::JobNotFound,
            7 => BlessErrorCode::ServiceUnavailable,
            8 => BlessErrorCode::JobPlistNotFound,
            9 => BlessErrorCode::JobMustBeEnabled,
            10 => BlessErrorCode::InvalidPlist,
            11 => BlessErrorCode::LaunchDeniedByUser,
            12 => BlessErrorCode::AlreadyRegistered,
            other => BlessErrorCode::Unknown(other),
        }
    }
}

impl BlessErrorCode {
    fn name(&self) -> Option<&'static str> {
        Some(match self {
            BlessErrorCode::InternalFailure => "kSMErrorInternalFailure",
            BlessErrorCode::InvalidSignature => "kSMErrorInvalidSignature",
            BlessErrorCode::AuthorizationFailure => "kSMErrorAuthorizationFailure",
            BlessErrorCode::ToolNotValid => "kSMErrorToolNotValid",
            BlessErrorCode::JobNotFound => "kSMErrorJobNotFound",
            BlessErrorCode::ServiceUnavailable => "kSMErrorServiceUnavailable",
            BlessErrorCode::JobPlistNotFound => "kSMErrorJobPlistNotFound",
            BlessErrorCode::JobMustBeEnabled => "kSMErrorJobMustBeEnabled",
            BlessErrorCode::InvalidPlist => "kSMErrorInvalidPlist",
            BlessErrorCode::LaunchDeniedByUser => "kSMErrorLaunchDeniedByUser",
            BlessErrorCode::AlreadyRegistered => "kSMErrorAlreadyRegistered",
            BlessErrorCode::Unknown(_) => return None,
        })
    }
}

/// Failure of the elevated install path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    AuthorizationFailed(i32),
    AdminRightsDenied(i32),
    Bless { code: BlessErrorCode, label: String },
}

impl InstallError {
    /// Text shown to the user.
    pub fn alert_text(&self) -> String {
        match self {
            InstallError::AuthorizationFailed(_) => "Failed to create authorization!".to_string(),
            InstallError::AdminRightsDenied(_) => "Failed to get admin authorization!".to_string(),
            InstallError::Bless {
                code: BlessErrorCode::JobMustBeEnabled,
                label,
            } => format!(
                "Privileged Helper is disabled by other process. Please run \"{}\" in your terminal. The command has been copied to your pasteboard",
                enable_command(label)
            ),
            InstallError::Bless {
                code: BlessErrorCode::Unknown(code),
                ..
            } => format!("bless unknown error: {}", code),
            InstallError::Bless { code, .. } => {
                format!("blessError: {}", code.name().unwrap_or("unknown"))
            }
        }
    }

    pub fn should_retry_legacy(&self) -> bool {
        !matches!(
            self,
            InstallError::Bless {
                code: BlessErrorCode::JobMustBeEnabled,
                ..
            }
        )
    }

    /// Command the user has to run themselves, copied to the clipboard.
    pub fn clipboard_remediation(&self) -> Option<String> {
        match self {
            InstallError::Bless {
                code: BlessErrorCode::JobMustBeEnabled,
                label,
            } => Some(enable_command(label)),
            _ => None,
        }
    }
}

fn enable_command(label: &str) -> String {
    format!("sudo launchctl enable system/{}", label)
}

impl Display for InstallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::AuthorizationFailed(status) => {
                write!(f, "Authorization failed with status: {}", status)
            }
            InstallError::AdminRightsDenied(status) => {
                write!(f, "Admin rights denied with status: {}", status)
            }
            InstallError::Bless { code, label } => {
                write!(f, "SMJobBless failed for {}: {:?}", label, code)
            }
        }
    }
}

impl std::error::Error for InstallError {}

#[derive(Debug)]
pub enum ScriptError {
    Io(std::io::Error),
    Cancelled,
    Failed { status: Option<i32>, stderr: String },
}

impl Display for ScriptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Io(e) => write!(f, "Failed to run script: {}", e),
            ScriptError::Cancelled => write!(f, "User cancelled the administrator prompt"),
            ScriptError::Failed { status, stderr } => match status {
                Some(code) => write!(f, "Script failed with exit code {}: {}", code, stderr.trim()),
                None => write!(f, "Script terminated: {}", stderr.trim()),
            },
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<std::io::Error> for ScriptError {
    fn from(e: std::io::Error) -> Self {
        ScriptError::Io(e)
    }
}
