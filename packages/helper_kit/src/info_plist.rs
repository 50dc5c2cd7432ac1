//! Reading the Info.plist embedded in a helper binary's `__TEXT,__info_plist` section.

use std::collections::HashMap;

use crate::version::HelperVersion;

/// Reads `"key" = "value";` pairs from `launchctl plist` output.
pub fn parse_launchctl_plist(output: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();

    for line in output.lines() {
        let Some((key, value)) = line.split_once(" = ") else { continue };

        let key = key.trim().trim_matches('"');
        let value = value.trim().trim_end_matches(';').trim_matches('"');
        if key.is_empty() || value.starts_with('{') || value.starts_with('(') {
            continue;
        }

        values.insert(key.to_string(), value.to_string());
    }

    values
}

pub fn version_from_info(info: &HashMap<String, String>) -> Option<HelperVersion> {
    Some(HelperVersion::new(
        info.get("CFBundleIdentifier")?.as_str(),
        info.get("CFBundleVersion")?.as_str(),
        info.get("CFBundleShortVersionString")?.as_str(),
    ))
}

/// Runs `launchctl plist __TEXT,__info_plist` against `binary`.
#[cfg(target_os = "macos")]
pub fn read_embedded_version(binary: &std::path::Path) -> Option<HelperVersion> {
    let output = std::process::Command::new("launchctl")
        .arg("plist")
        .arg("__TEXT,__info_plist")
        .arg(binary)
        .output();

    let output = match output {
        Ok(output) if output.status.success() => output,
        Ok(output) => {
            tracing::error!(status = ?output.status, path = %binary.display(), "failed to read embedded info plist");
            return None;
        }
        Err(error) => {
            tracing::error!(?error, "failed to run launchctl");
            return None;
        }
    };

    let info = parse_launchctl_plist(&String::from_utf8_lossy(&output.stdout));
    version_from_info(&info)
}
