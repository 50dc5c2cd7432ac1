#![allow(non_upper_case_globals)]

use std::ffi::c_void;
use std::mem::MaybeUninit;

use core_foundation::array::{CFArray, CFArrayRef};
use core_foundation::base::TCFType;
use core_foundation::dictionary::{CFDictionary, CFDictionaryRef};
use core_foundation::string::{CFString, CFStringRef};
use security_framework::certificate::SecCertificate;
use security_framework::os::macos::code_signing::{Flags, GuestAttributes, SecCode, SecStaticCode};

use super::{Certificate, CodeSigning, CodesignError};

type OSStatus = i32;
type SecCodeRef = <SecCode as TCFType>::Ref;
type SecStaticCodeRef = <SecStaticCode as TCFType>::Ref;

const errSecSuccess: OSStatus = 0;
const kSecCSSigningInformation: u32 = 1 << 1;

/* not wrapped by security-framework: static code of a live guest, validity
 * without a requirement, and the signing information dictionary */
#[link(name = "Security", kind = "framework")]
unsafe extern "C" {
    static kSecCodeInfoCertificates: CFStringRef;

    fn SecCodeCopyStaticCode(code: SecCodeRef, flags: u32, static_code: *mut SecStaticCodeRef) -> OSStatus;
    fn SecStaticCodeCheckValidity(
        static_code: SecStaticCodeRef,
        flags: u32,
        requirement: *const c_void,
    ) -> OSStatus;
    fn SecCodeCopySigningInformation(
        code: SecStaticCodeRef,
        flags: u32,
        information: *mut CFDictionaryRef,
    ) -> OSStatus;
}

/// Reads certificate chains through the Security framework.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecurityCodeSigning;

impl CodeSigning for SecurityCodeSigning {
    fn certificates_for_self(&self) -> Result<Vec<Certificate>, CodesignError> {
        let code = SecCode::for_self(Flags::NONE).map_err(|e| failed("SecCodeCopySelf", e.code()))?;
        let static_code = copy_static_code(&code)?;
        certificates(&static_code)
    }

    fn certificates_for_pid(&self, pid: i32) -> Result<Vec<Certificate>, CodesignError> {
        let mut attributes = GuestAttributes::new();
        attributes.set_pid(pid);

        let code = SecCode::copy_guest_with_attribues(None, &attributes, Flags::NONE)
            .map_err(|e| failed("SecCodeCopyGuestWithAttributes", e.code()))?;
        let static_code = copy_static_code(&code)?;

        let flags = Flags::DO_NOT_VALIDATE_RESOURCES | Flags::CHECK_NESTED_CODE;
        let status = unsafe {
            SecStaticCodeCheckValidity(static_code.as_concrete_TypeRef(), flags.bits(), std::ptr::null())
        };
        check_status("SecStaticCodeCheckValidity", status)?;

        certificates(&static_code)
    }
}

fn failed(call: &str, status: OSStatus) -> CodesignError {
    CodesignError::CodeSignCheckFailed(format!("{} failed with OSStatus {}", call, status))
}

fn check_status(call: &str, status: OSStatus) -> Result<(), CodesignError> {
    if status == errSecSuccess {
        return Ok(());
    }
    Err(failed(call, status))
}

fn copy_static_code(code: &SecCode) -> Result<SecStaticCode, CodesignError> {
    let mut static_code = MaybeUninit::<SecStaticCodeRef>::uninit();
    let status = unsafe {
        SecCodeCopyStaticCode(code.as_concrete_TypeRef(), Flags::NONE.bits(), static_code.as_mut_ptr())
    };
    check_status("SecCodeCopyStaticCode", status)?;

    Ok(unsafe { SecStaticCode::wrap_under_create_rule(static_code.assume_init()) })
}

fn certificates(static_code: &SecStaticCode) -> Result<Vec<Certificate>, CodesignError> {
    let mut info = MaybeUninit::<CFDictionaryRef>::uninit();
    let status = unsafe {
        SecCodeCopySigningInformation(
            static_code.as_concrete_TypeRef(),
            kSecCSSigningInformation,
            info.as_mut_ptr(),
        )
    };
    check_status("SecCodeCopySigningInformation", status)?;
    let info: CFDictionary = unsafe { CFDictionary::wrap_under_create_rule(info.assume_init()) };

    let key = unsafe { CFString::wrap_under_get_rule(kSecCodeInfoCertificates) };

    /* unsigned code has no certificate entry */
    let Some(chain) = info.find(key.as_CFTypeRef()) else {
        return Ok(Vec::new());
    };
    let chain: CFArray<SecCertificate> = unsafe { CFArray::wrap_under_get_rule(*chain as CFArrayRef) };

    Ok(chain.iter().map(|certificate| Certificate(certificate.to_der())).collect())
}
