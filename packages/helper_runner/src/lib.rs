pub mod delegate;
pub mod dispatcher;
pub mod process;
pub mod run_state;
pub mod runner;
pub mod uninstall;

pub use delegate::{ConnectionBehavior, RunnerDelegate};
pub use dispatcher::Dispatcher;
pub use runner::{HelperRunner, RunnerError};
