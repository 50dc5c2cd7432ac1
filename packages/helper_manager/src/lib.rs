pub mod broker;
pub mod delegate;
pub mod error;
pub mod install;
pub mod manager;
pub mod platform;
pub mod script;

#[cfg(test)]
mod testing;

pub use broker::ConnectionBroker;
pub use delegate::{
    DisconnectReason, HelperDelegate, InstallChoice, InstallReport, LegacyInstallChoice,
    LoginItemChoice, minimum_uninstall_version,
};
pub use error::HelperError;
pub use manager::{HelperManager, HelperStatus};
pub use platform::HelperPlatform;
