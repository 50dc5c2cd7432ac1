use privileged_helper_kit::channel::ServiceClientError;

#[derive(Debug)]
pub enum HelperError {
    ConnectFailed(std::io::Error),
    Channel(ServiceClientError),
    WorkingDirectoryNotProvided,
    RunnerVersionEmpty,
}

impl std::fmt::Display for HelperError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HelperError::ConnectFailed(e) => write!(f, "Failed to connect to helper: {}", e),
            HelperError::Channel(e) => write!(f, "Helper channel error: {}", e),
            HelperError::WorkingDirectoryNotProvided => write!(f, "Working directory not provided"),
            HelperError::RunnerVersionEmpty => write!(f, "Runner bundle version is empty"),
        }
    }
}

impl std::error::Error for HelperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HelperError::ConnectFailed(e) => Some(e),
            HelperError::Channel(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ServiceClientError> for HelperError {
    fn from(e: ServiceClientError) -> Self {
        HelperError::Channel(e)
    }
}
