use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::paths::HelperPaths;

/// launchd job definition written by the legacy install path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDaemonDescriptor {
    pub label: String,
    pub associated_bundle_identifier: String,
    pub program: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchdPlist<'a> {
    associated_bundle_identifiers: &'a str,
    keep_alive: KeepAlive,
    label: &'a str,
    mach_services: BTreeMap<&'a str, bool>,
    program: String,
    program_arguments: Vec<String>,
    run_at_load: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct KeepAlive {
    successful_exit: bool,
}

impl LaunchDaemonDescriptor {
    pub fn new(paths: &HelperPaths, associated_bundle_identifier: &str) -> Self {
        LaunchDaemonDescriptor {
            label: paths.label().to_string(),
            associated_bundle_identifier: associated_bundle_identifier.to_string(),
            program: paths.installed_binary(),
        }
    }

    /// Arguments launchd starts the helper with. The label is passed
    /// explicitly so the daemon binds the socket its callers dial.
    pub fn program_arguments(&self) -> Vec<String> {
        vec![
            self.program.to_string_lossy().into_owned(),
            "--label".to_string(),
            self.label.clone(),
        ]
    }

    pub fn render(&self) -> Result<String, plist::Error> {
        let job = LaunchdPlist {
            associated_bundle_identifiers: &self.associated_bundle_identifier,
            keep_alive: KeepAlive {
                successful_exit: false,
            },
            label: &self.label,
            mach_services: BTreeMap::from([(self.label.as_str(), true)]),
            program: self.program.to_string_lossy().into_owned(),
            program_arguments: self.program_arguments(),
            run_at_load: true,
        };

        let mut out = Vec::new();
        plist::to_writer_xml(&mut out, &job)?;
        out.push(b'\n');

        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod test {
    use plist::Value;

    use super::LaunchDaemonDescriptor;
    use crate::paths::HelperPaths;

    fn parse(rendered: &str) -> plist::Dictionary {
        Value::from_reader_xml(rendered.as_bytes())
            .unwrap()
            .into_dictionary()
            .unwrap()
    }

    #[test]
    fn renders_launchd_keys() {
        let paths = HelperPaths::new("com.example.helper");
        let rendered = LaunchDaemonDescriptor::new(&paths, "com.example.app").render().unwrap();
        assert!(rendered.starts_with("<?xml version=\"1.0\""));

        let job = parse(&rendered);
        assert_eq!(
            job.get("AssociatedBundleIdentifiers").and_then(Value::as_string),
            Some("com.example.app")
        );
        assert_eq!(job.get("Label").and_then(Value::as_string), Some("com.example.helper"));
        assert_eq!(
            job.get("Program").and_then(Value::as_string),
            Some("/Library/PrivilegedHelperTools/com.example.helper")
        );
        assert_eq!(job.get("RunAtLoad").and_then(Value::as_boolean), Some(true));

        let keep_alive = job.get("KeepAlive").and_then(Value::as_dictionary).unwrap();
        assert_eq!(keep_alive.get("SuccessfulExit").and_then(Value::as_boolean), Some(false));

        let mach = job.get("MachServices").and_then(Value::as_dictionary).unwrap();
        assert_eq!(mach.get("com.example.helper").and_then(Value::as_boolean), Some(true));
    }

    #[test]
    fn program_arguments_carry_label() {
        let paths = HelperPaths::new("com.example.helper");
        let job = parse(&LaunchDaemonDescriptor::new(&paths, "com.example.app").render().unwrap());

        let args: Vec<&str> = job
            .get("ProgramArguments")
            .and_then(Value::as_array)
            .unwrap()
            .iter()
            .filter_map(Value::as_string)
            .collect();
        assert_eq!(
            args,
            vec![
                "/Library/PrivilegedHelperTools/com.example.helper",
                "--label",
                "com.example.helper"
            ]
        );
    }

    #[test]
    fn markup_in_values_survives() {
        let paths = HelperPaths::new("com.example.helper");
        let job = parse(&LaunchDaemonDescriptor::new(&paths, "a&b<c>").render().unwrap());
        assert_eq!(
            job.get("AssociatedBundleIdentifiers").and_then(Value::as_string),
            Some("a&b<c>")
        );
    }
}
