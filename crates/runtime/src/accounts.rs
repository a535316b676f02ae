//! Account directory: which operating-system accounts may own tasks.
//!
//! An account is allowed when its primary group id is in the fixed allow-list
//! or it is listed as a member of a group with such an id. On hosts without a
//! POSIX account database the directory degrades to a single default account
//! deduced from the environment.

use std::collections::BTreeSet;

#[cfg(unix)]
use std::ffi::{CStr, CString};

#[cfg(unix)]
use parking_lot::Mutex;

/// Primary/supplemental group ids whose members may own tasks.
pub const ALLOWED_ACCOUNT_GIDS: [u32; 3] = [0, 1000, 1001];

/// The passwd/group iteration APIs are not reentrant; serialize access.
#[cfg(unix)]
static ACCOUNT_DB_LOCK: Mutex<()> = Mutex::new(());

/// Errors produced by allow-list checks.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("no allowed accounts found in system groups 0/1000/1001")]
    NoneAllowed,
    #[error("current system cannot determine default account")]
    NoDefault,
    #[error("account must belong to system groups 0/1000/1001")]
    NotAllowed,
    #[error("this platform only supports using account {0}")]
    DefaultOnly(String),
}

/// Resolved passwd entry for an account.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

#[derive(Debug, Clone)]
enum Mode {
    /// Read the live POSIX account database.
    Posix,
    /// No account database; a single default account is usable.
    Fallback,
    /// Fixed allow-list, independent of the host (embedding and tests).
    Fixed(Vec<String>),
}

/// Read-only view over the allowed-accounts set.
#[derive(Debug, Clone)]
pub struct AccountDirectory {
    default_account: String,
    mode: Mode,
}

impl AccountDirectory {
    /// Directory backed by the host account database (or the environment
    /// fallback where no database exists).
    pub fn from_system() -> Self {
        let mode = if cfg!(unix) { Mode::Posix } else { Mode::Fallback };
        Self {
            default_account: detect_default_account(),
            mode,
        }
    }

    /// Directory with a fixed allow-list; the first entry doubles as the
    /// default account.
    pub fn fixed(accounts: Vec<String>) -> Self {
        let default_account = accounts.first().cloned().unwrap_or_default();
        Self {
            default_account,
            mode: Mode::Fixed(accounts),
        }
    }

    pub fn posix_supported(&self) -> bool {
        match self.mode {
            Mode::Posix | Mode::Fixed(_) => true,
            Mode::Fallback => false,
        }
    }

    pub fn default_account(&self) -> &str {
        &self.default_account
    }

    /// Distinct account names whose primary or supplemental group is allowed,
    /// sorted.
    pub fn list_allowed(&self) -> Vec<String> {
        match &self.mode {
            Mode::Posix => list_posix_accounts(),
            Mode::Fallback => {
                if self.default_account.is_empty() {
                    Vec::new()
                } else {
                    vec![self.default_account.clone()]
                }
            }
            Mode::Fixed(accounts) => {
                let set: BTreeSet<String> = accounts.iter().cloned().collect();
                set.into_iter().collect()
            }
        }
    }

    /// Check a name against the allow-list, returning the account to use.
    pub fn ensure_allowed(&self, account: &str) -> Result<String, AccountError> {
        let allowed = self.list_allowed();
        if allowed.is_empty() {
            if self.posix_supported() {
                return Err(AccountError::NoneAllowed);
            }
            return Err(AccountError::NoDefault);
        }
        if !self.posix_supported() {
            let default_account = &allowed[0];
            if !account.is_empty() && account != default_account {
                return Err(AccountError::DefaultOnly(default_account.clone()));
            }
            return Ok(default_account.clone());
        }
        if !allowed.iter().any(|a| a == account) {
            return Err(AccountError::NotAllowed);
        }
        Ok(account.to_string())
    }
}

/// Default account deduced from the environment, falling back to the
/// process owner.
pub fn detect_default_account() -> String {
    for key in ["SCHEDULER_DEFAULT_ACCOUNT", "USERNAME", "USER"] {
        if let Ok(value) = std::env::var(key) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    current_account_name().unwrap_or_else(|| "current_user".to_string())
}

/// Name of the current effective account, from the account database.
#[cfg(unix)]
pub fn current_account_name() -> Option<String> {
    let _guard = ACCOUNT_DB_LOCK.lock();
    unsafe {
        let entry = libc::getpwuid(libc::geteuid());
        if entry.is_null() {
            return None;
        }
        Some(CStr::from_ptr((*entry).pw_name).to_string_lossy().into_owned())
    }
}

#[cfg(not(unix))]
pub fn current_account_name() -> Option<String> {
    None
}

/// Resolve a passwd entry by account name.
#[cfg(unix)]
pub fn lookup_account(name: &str) -> Option<AccountRecord> {
    let cname = CString::new(name).ok()?;
    let _guard = ACCOUNT_DB_LOCK.lock();
    unsafe {
        let entry = libc::getpwnam(cname.as_ptr());
        if entry.is_null() {
            return None;
        }
        let entry = &*entry;
        Some(AccountRecord {
            name: name.to_string(),
            uid: entry.pw_uid,
            gid: entry.pw_gid,
            home: CStr::from_ptr(entry.pw_dir).to_string_lossy().into_owned(),
        })
    }
}

#[cfg(not(unix))]
pub fn lookup_account(_name: &str) -> Option<AccountRecord> {
    None
}

/// All group ids the account belongs to (primary plus supplemental), sorted.
#[cfg(unix)]
pub fn account_group_ids(name: &str, primary_gid: u32) -> Vec<u32> {
    let Ok(cname) = CString::new(name) else {
        return vec![primary_gid];
    };
    let mut count: libc::c_int = 32;
    loop {
        let mut groups = vec![0 as libc::gid_t; count as usize];
        let rc = unsafe {
            libc::getgrouplist(cname.as_ptr(), primary_gid, groups.as_mut_ptr(), &mut count)
        };
        if rc >= 0 {
            groups.truncate(count.max(0) as usize);
            let set: BTreeSet<u32> = groups.into_iter().collect();
            return set.into_iter().collect();
        }
        if count as usize <= groups.len() {
            // kernel refused without asking for more room
            return vec![primary_gid];
        }
    }
}

#[cfg(unix)]
fn list_posix_accounts() -> Vec<String> {
    let mut accounts: BTreeSet<String> = BTreeSet::new();
    let _guard = ACCOUNT_DB_LOCK.lock();
    unsafe {
        libc::setpwent();
        loop {
            let entry = libc::getpwent();
            if entry.is_null() {
                break;
            }
            let entry = &*entry;
            if ALLOWED_ACCOUNT_GIDS.contains(&entry.pw_gid) {
                accounts.insert(CStr::from_ptr(entry.pw_name).to_string_lossy().into_owned());
            }
        }
        libc::endpwent();

        for gid in ALLOWED_ACCOUNT_GIDS {
            let group = libc::getgrgid(gid);
            if group.is_null() {
                continue;
            }
            let mut member = (*group).gr_mem;
            while !member.is_null() && !(*member).is_null() {
                let name = CStr::from_ptr(*member).to_string_lossy().into_owned();
                if !name.is_empty() {
                    accounts.insert(name);
                }
                member = member.add(1);
            }
        }
    }
    accounts.into_iter().collect()
}

#[cfg(not(unix))]
fn list_posix_accounts() -> Vec<String> {
    Vec::new()
}
