use serde::{Deserialize, Serialize};

use crate::channel::ServiceProto;
use crate::version::HelperVersion;

/// The three operations the privileged helper serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum HelperRequest {
    GetVersion { shared_directory: String },
    ExitProcess,
    Uninstall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum HelperResponse {
    /// `None` when the helper could not resolve its own descriptor
    Version(Option<HelperVersion>),
}

pub struct HelperProto;

impl ServiceProto for HelperProto {
    type Request = HelperRequest;
    type Response = HelperResponse;
}
