/*
 * Copyright 2024 Oxide Computer Company
 */

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};

#[cfg(target_os = "illumos")]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::___errno() }
}

#[cfg(target_os = "linux")]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

pub fn errno() -> i32 {
    unsafe { *errno_location() }
}

pub fn clear_errno() {
    unsafe {
        *errno_location() = 0;
    }
}

#[allow(unused)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passwd {
    pub name: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub dir: Option<String>,
}

impl Passwd {
    fn from(p: *const libc::passwd) -> Result<Passwd> {
        fn cs(lpsz: *const c_char) -> Result<Option<String>> {
            if lpsz.is_null() {
                Ok(None)
            } else {
                let cstr = unsafe { CStr::from_ptr(lpsz) };
                Ok(Some(cstr.to_str()?.to_string()))
            }
        }

        Ok(Passwd {
            name: cs(unsafe { (*p).pw_name })?,
            uid: unsafe { (*p).pw_uid },
            gid: unsafe { (*p).pw_gid },
            dir: cs(unsafe { (*p).pw_dir })?,
        })
    }
}

/*
 * getpwnam(3C) returns a pointer to static storage, so calls are serialised
 * within the process.
 */
static PASSWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

pub fn get_passwd_by_name(name: &str) -> Result<Option<Passwd>> {
    let name = CString::new(name.to_owned())?;

    let _g = PASSWD_LOCK.lock().unwrap();
    clear_errno();
    let p = unsafe { libc::getpwnam(name.as_ptr()) };
    let e = errno();
    if p.is_null() {
        /*
         * Some platforms report a missing entry with ENOENT or similar, rather
         * than leaving errno untouched.
         */
        match e {
            0 | libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM => {
                Ok(None)
            }
            e => bail!(
                "getpwnam: {}",
                std::io::Error::from_raw_os_error(e)
            ),
        }
    } else {
        Ok(Some(Passwd::from(p)?))
    }
}

pub fn chown<P: AsRef<Path>>(path: P, uid: u32, gid: u32) -> Result<()> {
    let path = path.as_ref();
    let cstr = CString::new(path.as_os_str().as_bytes())?;

    if unsafe { libc::chown(cstr.as_ptr(), uid, gid) } != 0 {
        let e = std::io::Error::last_os_error();

        bail!("chown {path:?}: {e}");
    }

    Ok(())
}

/**
 * A local account that jobs run on behalf of.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

pub trait UserDirectory: Send + Sync {
    /**
     * Look up a local account by name.  A missing account is an error.
     */
    fn resolve_user(&self, username: &str) -> Result<LocalUser>;
}

/**
 * Resolves users through the system password database.
 */
pub struct NssUsers;

impl UserDirectory for NssUsers {
    fn resolve_user(&self, username: &str) -> Result<LocalUser> {
        let u = get_passwd_by_name(username)?
            .ok_or_else(|| anyhow!("could not locate user {username:?}"))?;
        let home = u.dir.as_deref().ok_or_else(|| {
            anyhow!("could not locate home directory for {username:?}")
        })?;

        Ok(LocalUser {
            name: username.to_string(),
            uid: u.uid,
            gid: u.gid,
            home: PathBuf::from(home),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_exists() -> Result<()> {
        let u = NssUsers.resolve_user("root")?;
        assert_eq!(u.uid, 0);
        Ok(())
    }

    #[test]
    fn missing_user() {
        assert!(NssUsers
            .resolve_user("no-such-user-for-asyncbuild-tests")
            .is_err());
    }

    #[test]
    fn chown_to_self() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let f = dir.path().join("owned");
        std::fs::write(&f, b"x")?;

        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        chown(&f, uid, gid)?;

        assert!(chown(dir.path().join("missing"), uid, gid).is_err());
        Ok(())
    }
}
