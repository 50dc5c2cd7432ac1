//! Shell scripts run with root rights by the legacy install path.

use std::fmt::Write;
use std::path::Path;

use privileged_helper_kit::descriptor::LaunchDaemonDescriptor;
use privileged_helper_kit::paths::HelperPaths;

use crate::install::ScriptError;

/// Replaces any installed copy with the helper bundled in `app_path` and loads it.
pub fn install_script(
    paths: &HelperPaths,
    app_path: &Path,
    associated_bundle_identifier: &str,
) -> Result<String, ScriptError> {
    let label = paths.label();
    let plist = paths.launch_daemon_plist();
    let installed = paths.installed_binary();
    let bundled = paths.bundled_binary(app_path);
    let descriptor = LaunchDaemonDescriptor::new(paths, associated_bundle_identifier)
        .render()
        .map_err(std::io::Error::other)?;

    let mut script = String::new();
    let _ = writeln!(script, "#!/bin/bash");
    let _ = writeln!(script, "set -e");
    let _ = writeln!(script);
    let _ = writeln!(script, "plistPath={}", shell_quote(&plist.to_string_lossy()));
    let _ = writeln!(script, "rm -rf {}", shell_quote(&installed.to_string_lossy()));
    let _ = writeln!(script, "if [ -e \"${{plistPath}}\" ]; then");
    let _ = writeln!(script, "launchctl unload -w \"${{plistPath}}\"");
    let _ = writeln!(script, "rm \"${{plistPath}}\"");
    let _ = writeln!(script, "fi");
    let _ = writeln!(script, "launchctl remove {} || true", shell_quote(label));
    let _ = writeln!(script);
    let _ = writeln!(script, "mkdir -p {}", shell_quote(&paths.tools_dir().to_string_lossy()));
    let _ = writeln!(
        script,
        "cp {} {}",
        shell_quote(&bundled.to_string_lossy()),
        shell_quote(&installed.to_string_lossy())
    );
    let _ = writeln!(script);
    let _ = writeln!(script, "cat > \"${{plistPath}}\" <<'PLIST'");
    script.push_str(&descriptor);
    let _ = writeln!(script, "PLIST");
    let _ = writeln!(script);
    let _ = writeln!(script, "launchctl load -w \"${{plistPath}}\"");
    Ok(script)
}

/// Unloads the job and deletes both installed files.
pub fn removal_script(paths: &HelperPaths) -> String {
    let mut script = String::new();
    let _ = writeln!(script, "launchctl remove {} || true", shell_quote(paths.label()));
    let _ = writeln!(
        script,
        "rm -rf {}",
        shell_quote(&paths.launch_daemon_plist().to_string_lossy())
    );
    let _ = writeln!(
        script,
        "rm -rf {}",
        shell_quote(&paths.installed_binary().to_string_lossy())
    );
    script
}

/// AppleScript that runs `script` through the administrator prompt.
pub fn administrator_applescript(script: &str) -> String {
    let mut escaped = String::with_capacity(script.len());
    for c in script.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            c => escaped.push(c),
        }
    }
    format!("do shell script \"{}\" with administrator privileges", escaped)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}
