use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
#[command(name = "helperctl", about = "Install and query the privileged helper")]
struct Cli {
    /// settings file (.toml or .json)
    #[arg(long)]
    settings: Option<String>,
    /// launchd label of the helper, overrides the settings file
    #[arg(long)]
    label: Option<String>,
    /// app bundle shipping the helper, defaults to the bundle containing this binary
    #[arg(long)]
    app_path: Option<String>,
    /// directory shared with the helper
    #[arg(long)]
    shared_dir: Option<String>,
    /// oldest helper short version that can uninstall itself
    #[arg(long)]
    min_uninstall_version: Option<String>,
    #[arg(long)]
    log_path: Option<String>,
    /// answer yes to every prompt
    #[arg(short, long)]
    yes: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
enum Command {
    Status,
    Install,
    Version,
    Exit,
    Uninstall,
}

#[cfg(not(target_os = "macos"))]
fn main() -> ExitCode {
    let _ = Cli::parse();
    eprintln!("helperctl is only supported on macOS");
    ExitCode::FAILURE
}

#[cfg(target_os = "macos")]
#[tokio::main]
async fn main() -> ExitCode {
    macos::run(Cli::parse()).await
}

#[cfg(target_os = "macos")]
mod macos {
    use std::path::PathBuf;
    use std::process::ExitCode;

    use privileged_helper_kit::HelperVersion;
    use privileged_helper_kit::logging::init_logging;
    use privileged_helper_kit::settings::HelperSettings;
    use privileged_helper_manager::platform::MacPlatform;
    use privileged_helper_manager::{
        DisconnectReason, HelperDelegate, HelperManager, HelperPlatform, InstallChoice, InstallReport,
        LegacyInstallChoice, LoginItemChoice, minimum_uninstall_version,
    };
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::{Cli, Command};

    struct TerminalDelegate {
        shared_directory: Option<String>,
        minimum_uninstall: Option<HelperVersion>,
        assume_yes: bool,
    }

    impl TerminalDelegate {
        async fn ask(&self, question: &str, options: &[&str]) -> usize {
            if self.assume_yes {
                return 0;
            }

            let mut stdout = tokio::io::stdout();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();

            loop {
                let prompt = format!("{} [{}]: ", question, options.join("/"));
                let _ = stdout.write_all(prompt.as_bytes()).await;
                let _ = stdout.flush().await;

                let answer = match lines.next_line().await {
                    Ok(Some(line)) => line.trim().to_lowercase(),
                    _ => return options.len() - 1,
                };

                if let Some(pos) = options.iter().position(|o| o.starts_with(&answer) && !answer.is_empty()) {
                    return pos;
                }
            }
        }
    }

    impl HelperDelegate for TerminalDelegate {
        fn shared_directory(&self) -> Option<String> {
            self.shared_directory.clone()
        }

        fn minimum_uninstall_version(&self) -> Option<HelperVersion> {
            self.minimum_uninstall.clone()
        }

        fn on_disconnect(&self, reason: DisconnectReason) {
            tracing::debug!(?reason, "helper disconnected");
        }

        fn on_installed(&self, report: InstallReport) {
            println!(
                "helper installed (update: {}, legacy: {}, tries: {})",
                report.after_update, report.legacy, report.tries
            );
        }

        async fn show_text_alert(&self, text: String) {
            eprintln!("{}", text);
        }

        async fn show_login_item_alert(&self) -> LoginItemChoice {
            let picked = self
                .ask(
                    "The helper is waiting for approval in Login Items",
                    &["open settings", "reset daemon"],
                )
                .await;
            if picked == 0 {
                LoginItemChoice::OpenSystemSettings
            } else {
                LoginItemChoice::ResetDaemon
            }
        }

        async fn show_install_alert(&self) -> InstallChoice {
            match self
                .ask("The privileged helper needs to be installed", &["install", "cancel", "quit"])
                .await
            {
                0 => InstallChoice::Install,
                1 => InstallChoice::Cancel,
                _ => InstallChoice::Quit,
            }
        }

        async fn show_legacy_install_alert(&self) -> LegacyInstallChoice {
            match self
                .ask("Install the helper with an administrator script instead", &["confirm", "cancel"])
                .await
            {
                0 => LegacyInstallChoice::Confirm,
                _ => LegacyInstallChoice::Cancel,
            }
        }
    }

    pub async fn run(cli: Cli) -> ExitCode {
        let _guard = init_logging(cli.log_path.as_deref());

        let settings = match HelperSettings::load(cli.settings.clone()).await {
            Ok((settings, _)) => settings.with_label_override(cli.label.clone()),
            Err(error) => {
                eprintln!("failed to load settings: {}", error);
                return ExitCode::FAILURE;
            }
        };

        let platform = match &cli.app_path {
            Some(path) => MacPlatform::new(settings.paths(), PathBuf::from(path)),
            None => match MacPlatform::for_current_app(settings.paths()) {
                Ok(platform) => platform,
                Err(error) => {
                    eprintln!("{}, pass --app-path", error);
                    return ExitCode::FAILURE;
                }
            },
        };

        let delegate = TerminalDelegate {
            shared_directory: cli.shared_dir.clone(),
            minimum_uninstall: cli.min_uninstall_version.as_ref().map(|short| {
                let bundled = platform.bundled_helper_version();
                minimum_uninstall_version(bundled.as_ref(), &settings.label, short)
            }),
            assume_yes: cli.yes,
        };

        let manager = HelperManager::new(&settings, delegate, platform);

        match cli.command {
            Command::Status => {
                println!("{:?}", manager.helper_status().await);
            }
            Command::Install => {
                if !manager.check_helper_install().await {
                    return ExitCode::FAILURE;
                }
            }
            Command::Version => match manager.helper_version().await {
                Ok(version) => println!("{}", version),
                Err(error) => {
                    eprintln!("{}", error);
                    return ExitCode::FAILURE;
                }
            },
            Command::Exit => {
                manager.broker().exit_peer().await;
                tokio::time::sleep(settings.timing.kill_wait()).await;
            }
            Command::Uninstall => {
                manager.broker().uninstall_peer().await;
                tokio::time::sleep(settings.timing.uninstall_wait()).await;
            }
        }

        ExitCode::SUCCESS
    }
}
