#![allow(non_upper_case_globals)]

use std::ffi::CString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use core_foundation::base::TCFType;
use core_foundation::error::{CFError, CFErrorRef};
use core_foundation::string::{CFString, CFStringRef};
use privileged_helper_kit::HelperVersion;
use privileged_helper_kit::info_plist::read_embedded_version;
use privileged_helper_kit::paths::HelperPaths;
use security_framework_sys::authorization::{
    AuthorizationCreate, AuthorizationFree, AuthorizationItem, AuthorizationItemSet, AuthorizationRef,
    errAuthorizationSuccess, kAuthorizationFlagDefaults, kAuthorizationFlagExtendRights,
    kAuthorizationFlagInteractionAllowed, kAuthorizationFlagPreAuthorize,
};

use super::{HelperPlatform, is_label_disabled, macos_major_version};
use crate::install::{BlessErrorCode, InstallError, ScriptError};
use crate::script::administrator_applescript;

const kSMRightBlessPrivilegedHelper: &str = "com.apple.ServiceManagement.blesshelper";

const LOGIN_ITEMS_SETTINGS_URL: &str = "x-apple.systempreferences:com.apple.LoginItems-Settings.extension";

/* ServiceManagement has no binding crate */
#[link(name = "ServiceManagement", kind = "framework")]
unsafe extern "C" {
    static kSMDomainSystemLaunchd: CFStringRef;

    fn SMJobBless(
        domain: CFStringRef,
        executable_label: CFStringRef,
        auth: AuthorizationRef,
        error: *mut CFErrorRef,
    ) -> u8;
}

struct Authorization(AuthorizationRef);

impl Drop for Authorization {
    fn drop(&mut self) {
        unsafe { AuthorizationFree(self.0, kAuthorizationFlagDefaults) };
    }
}

pub struct MacPlatform {
    paths: HelperPaths,
    app_path: PathBuf,
}

impl MacPlatform {
    pub fn new(paths: HelperPaths, app_path: PathBuf) -> Self {
        MacPlatform { paths, app_path }
    }

    /// Uses the `.app` bundle containing the running executable.
    pub fn for_current_app(paths: HelperPaths) -> std::io::Result<Self> {
        let exe = std::env::current_exe()?;
        let app_path = exe
            .ancestors()
            .find(|p| p.extension().is_some_and(|ext| ext == "app"))
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not inside an app bundle", exe.display()),
                )
            })?;

        Ok(Self::new(paths, app_path))
    }

    fn authorize(&self) -> Result<Authorization, InstallError> {
        let mut auth: AuthorizationRef = std::ptr::null_mut();
        let status = unsafe {
            AuthorizationCreate(
                std::ptr::null(),
                std::ptr::null(),
                kAuthorizationFlagPreAuthorize,
                &mut auth,
            )
        };
        if status != errAuthorizationSuccess {
            tracing::error!(status, "authorization failed");
            return Err(InstallError::AuthorizationFailed(status));
        }
        let _empty = Authorization(auth);

        let right = CString::new(kSMRightBlessPrivilegedHelper).map_err(|_| InstallError::AuthorizationFailed(-1))?;
        let mut item = AuthorizationItem {
            name: right.as_ptr(),
            valueLength: 0,
            value: std::ptr::null_mut(),
            flags: 0,
        };
        let rights = AuthorizationItemSet {
            count: 1,
            items: &mut item,
        };

        let mut auth: AuthorizationRef = std::ptr::null_mut();
        let status = unsafe {
            AuthorizationCreate(
                &rights,
                std::ptr::null(),
                kAuthorizationFlagInteractionAllowed | kAuthorizationFlagPreAuthorize | kAuthorizationFlagExtendRights,
                &mut auth,
            )
        };
        if status != errAuthorizationSuccess {
            tracing::error!(status, "couldn't obtain admin privileges");
            return Err(InstallError::AdminRightsDenied(status));
        }

        Ok(Authorization(auth))
    }
}

impl HelperPlatform for MacPlatform {
    fn app_path(&self) -> PathBuf {
        self.app_path.clone()
    }

    fn bundled_helper_version(&self) -> Option<HelperVersion> {
        read_embedded_version(&self.paths.bundled_binary(&self.app_path))
    }

    fn installed_helper_exists(&self) -> bool {
        self.paths.installed_binary().exists()
    }

    fn requires_approval(&self, plist: &Path) -> bool {
        let major = Command::new("sw_vers")
            .arg("-productVersion")
            .output()
            .ok()
            .and_then(|output| macos_major_version(&String::from_utf8_lossy(&output.stdout)));

        /* login item approval exists since macOS 13 */
        if major.is_none_or(|major| major < 13) || !plist.exists() {
            return false;
        }

        match Command::new("launchctl").args(["print-disabled", "system"]).output() {
            Ok(output) => is_label_disabled(&String::from_utf8_lossy(&output.stdout), self.paths.label()),
            Err(error) => {
                tracing::error!(?error, "failed to read disabled services");
                false
            }
        }
    }

    fn open_login_items_settings(&self) {
        if let Err(error) = Command::new("open").arg(LOGIN_ITEMS_SETTINGS_URL).status() {
            tracing::error!(?error, "failed to open login items settings");
        }
    }

    fn copy_to_clipboard(&self, text: &str) {
        let child = Command::new("pbcopy").stdin(Stdio::piped()).spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(error) => {
                tracing::error!(?error, "failed to run pbcopy");
                return;
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(error) = stdin.write_all(text.as_bytes()) {
                tracing::error!(?error, "failed to write to pbcopy");
            }
        }
        let _ = child.wait();
    }

    fn bless(&self, label: &str) -> Result<(), InstallError> {
        tracing::info!(label, "installing helper daemon");
        let auth = self.authorize()?;

        let label_ref = CFString::new(label);

        let mut error: CFErrorRef = std::ptr::null_mut();
        let blessed = unsafe {
            SMJobBless(
                kSMDomainSystemLaunchd,
                label_ref.as_concrete_TypeRef(),
                auth.0,
                &mut error,
            )
        };

        if blessed == 0 {
            let code = if error.is_null() {
                0
            } else {
                unsafe { CFError::wrap_under_create_rule(error) }.code() as i64
            };
            tracing::error!(code, label, "SMJobBless failed");
            return Err(InstallError::Bless {
                code: BlessErrorCode::from(code),
                label: label.to_string(),
            });
        }

        tracing::info!(label, "helper installed successfully");
        Ok(())
    }

    fn run_privileged_script(&self, script: &str) -> Result<(), ScriptError> {
        let output = Command::new("osascript")
            .arg("-e")
            .arg(administrator_applescript(script))
            .output()?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        /* -128 is userCanceledErr */
        if stderr.contains("(-128)") {
            return Err(ScriptError::Cancelled);
        }

        Err(ScriptError::Failed {
            status: output.status.code(),
            stderr,
        })
    }

    fn terminate_app(&self) {
        tracing::info!("user chose to quit");
        std::process::exit(0);
    }
}
