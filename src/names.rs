//! UID/GID display-name resolution through the system user database.
//!
//! An attempted lookup always produces a display string: ids missing from
//! the database come back as `<unknown>` rather than falling through to the
//! decimal id, which is reserved for runs where resolution is switched off
//! entirely.

use std::ffi::CStr;

// Scratch space for the reentrant getpw/getgr calls.
const NAME_BUF_LEN: usize = 1024;

const UNKNOWN_NAME: &str = "<unknown>";

/// The login name for `uid`, or `<unknown>` if the user database has no
/// entry for it.
pub fn uid_name(uid: i32) -> Option<String> {
    let mut buffer = [0 as libc::c_char; NAME_BUF_LEN];
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut found: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(
            uid as libc::uid_t,
            &mut entry,
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut found,
        )
    };
    if rc != 0 || found.is_null() {
        return Some(UNKNOWN_NAME.to_string());
    }
    let name = unsafe { CStr::from_ptr(entry.pw_name) };
    Some(name.to_string_lossy().into_owned())
}

/// The group name for `gid`, or `<unknown>` if the group database has no
/// entry for it.
pub fn gid_name(gid: i32) -> Option<String> {
    let mut buffer = [0 as libc::c_char; NAME_BUF_LEN];
    let mut entry: libc::group = unsafe { std::mem::zeroed() };
    let mut found: *mut libc::group = std::ptr::null_mut();

    let rc = unsafe {
        libc::getgrgid_r(
            gid as libc::gid_t,
            &mut entry,
            buffer.as_mut_ptr(),
            buffer.len(),
            &mut found,
        )
    };
    if rc != 0 || found.is_null() {
        return Some(UNKNOWN_NAME.to_string());
    }
    let name = unsafe { CStr::from_ptr(entry.gr_name) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_zero_resolves() {
        // Every Unix user database knows the superuser.
        assert_eq!(uid_name(0).as_deref(), Some("root"));
    }

    #[test]
    fn current_ids_resolve() {
        let uid = unsafe { libc::getuid() } as i32;
        let gid = unsafe { libc::getgid() } as i32;
        assert!(uid_name(uid).is_some_and(|name| name != UNKNOWN_NAME));
        assert!(gid_name(gid).is_some_and(|name| name != UNKNOWN_NAME));
    }

    #[test]
    fn missing_ids_fall_back_to_unknown() {
        // Nobody allocates ids this deep into the positive range.
        assert_eq!(uid_name(0x7AB3_1DE4).as_deref(), Some(UNKNOWN_NAME));
        assert_eq!(gid_name(0x7AB3_1DE4).as_deref(), Some(UNKNOWN_NAME));
    }
}
