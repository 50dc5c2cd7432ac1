use std::path::PathBuf;

/// How the running helper starts its own uninstaller. The label and
/// settings file are forwarded so the child removes this helper's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallCommand {
    pub program: PathBuf,
    pub label: String,
    pub settings: Option<String>,
}

impl UninstallCommand {
    pub fn args(&self, pid: u32) -> Vec<String> {
        let mut args = vec!["--label".to_string(), self.label.clone()];
        if let Some(settings) = &self.settings {
            args.push("--settings".to_string());
            args.push(settings.clone());
        }
        args.push("uninstall".to_string());
        args.push(pid.to_string());
        args
    }
}

/// Process level side effects of the dispatcher.
pub trait ProcessControl: Send + Sync + 'static {
    fn exit(&self, code: i32);

    /// Starts the uninstaller for `pid` detached from this process.
    fn spawn_uninstaller(&self, command: &UninstallCommand, pid: u32) -> std::io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcess;

impl ProcessControl for SystemProcess {
    fn exit(&self, code: i32) {
        tracing::info!(code, "exiting");
        std::process::exit(code);
    }

    fn spawn_uninstaller(&self, command: &UninstallCommand, pid: u32) -> std::io::Result<()> {
        let child = std::process::Command::new(&command.program)
            .args(command.args(pid))
            .spawn()?;

        tracing::info!(child = child.id(), label = %command.label, "spawned uninstaller");
        Ok(())
    }
}
