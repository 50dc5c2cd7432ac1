pub mod channel;
pub mod codesign;
pub mod descriptor;
pub mod info_plist;
pub mod logging;
pub mod paths;
pub mod protocol;
pub mod settings;
pub mod version;

pub use protocol::{HelperProto, HelperRequest, HelperResponse};
pub use version::HelperVersion;
