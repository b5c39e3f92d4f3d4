//! Resolving a client pid to its executable path.
//!
//! App-namespace buckets are keyed by the canonicalized binary path of the
//! calling process. When the platform cannot resolve a pid (or there is no
//! pid at all), every such caller shares the [`ANONYMOUS_APP`] bucket.

use std::path::PathBuf;

use tracing::debug;

/// Bucket shared by all callers whose binary could not be resolved.
pub const ANONYMOUS_APP: &str = "anonymous";

/// Canonical binary path for `pid`, or [`ANONYMOUS_APP`].
#[must_use]
pub fn app_binary_for_pid(pid: Option<i32>) -> String {
    let Some(pid) = pid else {
        return ANONYMOUS_APP.to_owned();
    };
    if pid <= 0 {
        return ANONYMOUS_APP.to_owned();
    }

    match resolve(pid) {
        Some(path) => path.to_string_lossy().into_owned(),
        None => {
            debug!("could not resolve binary for pid {pid}");
            ANONYMOUS_APP.to_owned()
        }
    }
}

#[cfg(target_os = "linux")]
fn resolve(pid: i32) -> Option<PathBuf> {
    std::fs::canonicalize(format!("/proc/{pid}/exe")).ok()
}

#[cfg(not(target_os = "linux"))]
fn resolve(_pid: i32) -> Option<PathBuf> {
    // The BSDs would use the KERN_PROC_PATHNAME sysctl here.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_pid_is_anonymous() {
        assert_eq!(app_binary_for_pid(None), ANONYMOUS_APP);
        assert_eq!(app_binary_for_pid(Some(-1)), ANONYMOUS_APP);
        assert_eq!(app_binary_for_pid(Some(0)), ANONYMOUS_APP);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_pid_resolves_to_an_absolute_path() {
        #[allow(clippy::cast_possible_wrap)]
        let path = app_binary_for_pid(Some(std::process::id() as i32));
        assert!(path.starts_with('/'), "got {path}");
    }
}
