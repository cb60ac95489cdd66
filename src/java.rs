//! Finding the java executable.

use std::{
    env,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};
use crate::launch::find_on_path;

#[cfg(windows)]
const JAVA: &str = "java.exe";
#[cfg(not(windows))]
const JAVA: &str = "java";

/// `<home>/bin/java`, if it exists.
pub fn in_java_home(home: &Path) -> Option<PathBuf> {
    let java = home.join("bin").join(JAVA);
    if java.is_file() {
        Some(java)
    } else {
        None
    }
}

/// Locates java: under `java_home` if given, else under `$JAVA_HOME`, else on
/// the PATH.
///
/// An explicit home that has no java in it is an error; it is not silently
/// skipped in favour of some other installation.
pub fn java_executable(java_home: Option<&Path>) -> Result<PathBuf> {
    if let Some(home) = java_home {
        debug!("Looking for java in {}", home.display());
        return in_java_home(home).ok_or_else(|| Error::JavaNotFound(home.to_path_buf()));
    }

    if let Some(home) = env::var_os("JAVA_HOME").filter(|home| !home.is_empty()) {
        let home = PathBuf::from(home);
        debug!("Looking for java in JAVA_HOME ({})", home.display());
        match in_java_home(&home) {
            Some(java) => return Ok(java),
            None => warn!("JAVA_HOME ({}) has no {}, trying PATH", home.display(), JAVA),
        }
    }

    find_on_path(Path::new(JAVA)).ok_or_else(|| Error::JavaNotFound(PathBuf::from(JAVA)))
}
