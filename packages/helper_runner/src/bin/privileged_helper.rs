use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
#[command(name = "privileged-helper", about = "Privileged helper daemon, started by launchd")]
struct Cli {
    /// settings file (.toml or .json)
    #[arg(long)]
    settings: Option<String>,
    /// launchd label of the helper, defaults to the installed binary's name
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    log_path: Option<String>,
    /// exit once the last caller disconnects
    #[arg(long)]
    quit_when_idle: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
enum Command {
    /// wait for `pid` to exit, then remove the helper from the system
    Uninstall { pid: i32 },
}

#[cfg(not(target_os = "macos"))]
fn main() -> ExitCode {
    let _ = Cli::parse();
    eprintln!("privileged-helper is only supported on macOS");
    ExitCode::FAILURE
}

#[cfg(target_os = "macos")]
#[tokio::main]
async fn main() -> ExitCode {
    macos::run(Cli::parse()).await
}

#[cfg(target_os = "macos")]
mod macos {
    use std::process::ExitCode;
    use std::sync::Arc;

    use privileged_helper_kit::HelperVersion;
    use privileged_helper_kit::codesign::SecurityCodeSigning;
    use privileged_helper_kit::info_plist::read_embedded_version;
    use privileged_helper_kit::logging::init_logging;
    use privileged_helper_kit::settings::HelperSettings;
    use privileged_helper_runner::process::SystemProcess;
    use privileged_helper_runner::run_state::{FileRunStateStore, RunStateStore};
    use privileged_helper_runner::uninstall::{LaunchdRegistry, self_uninstall, wait_for_pid_exit};
    use privileged_helper_runner::{ConnectionBehavior, HelperRunner, RunnerDelegate};

    use super::{Cli, Command};

    struct EmbeddedInfoDelegate {
        version: Option<HelperVersion>,
        quit_when_idle: bool,
    }

    impl RunnerDelegate for EmbeddedInfoDelegate {
        fn helper_version(&self, shared_directory: &str) -> Option<HelperVersion> {
            tracing::debug!(%shared_directory, "version requested");
            self.version.clone()
        }

        fn on_connection_event(&self, behavior: ConnectionBehavior) {
            tracing::info!(?behavior, "connection event");
        }

        fn should_quit_when_idle(&self) -> bool {
            self.quit_when_idle
        }
    }

    pub async fn run(cli: Cli) -> ExitCode {
        let _guard = init_logging(cli.log_path.as_deref());

        let exe = match std::env::current_exe() {
            Ok(exe) => Some(exe),
            Err(error) => {
                tracing::error!(?error, "failed to locate own executable");
                None
            }
        };

        let settings = match HelperSettings::load(cli.settings.clone()).await {
            Ok((settings, _)) => settings.with_daemon_label(cli.label.clone(), exe.as_deref()),
            Err(error) => {
                tracing::error!(%error, "failed to load settings");
                return ExitCode::FAILURE;
            }
        };
        tracing::info!(label = %settings.label, "resolved helper label");

        let run_state = Arc::new(FileRunStateStore::new(settings.state_path()));

        if let Some(Command::Uninstall { pid }) = cli.command {
            wait_for_pid_exit(pid, settings.timing.uninstall_poll()).await;
            if let Err(error) = run_state.store(false) {
                tracing::error!(%error, "failed to update run state");
            }
            self_uninstall(&LaunchdRegistry, &settings.paths());
            return ExitCode::SUCCESS;
        }

        let version = exe.as_deref().and_then(read_embedded_version);
        if version.is_none() {
            tracing::warn!("embedded Info.plist not readable, version requests will be empty");
        }

        let runner = HelperRunner::new(
            &settings,
            Arc::new(SecurityCodeSigning),
            Arc::new(SystemProcess),
            run_state,
        )
        .with_settings_file(cli.settings.clone())
        .with_delegate(Arc::new(EmbeddedInfoDelegate {
            version,
            quit_when_idle: cli.quit_when_idle,
        }));

        let stop = runner.stop_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping");
                stop.cancel();
            }
        });

        match runner.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                tracing::error!(%error, "helper failed");
                ExitCode::FAILURE
            }
        }
    }
}
