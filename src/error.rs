use std::{io, path::PathBuf};

use thiserror::Error;

use crate::launch::LaunchState;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Errors which abort a launch, or which are logged during teardown.
#[derive(Debug, Error)]
pub enum Error {
    /// The options document is malformed or includes itself.
    #[error("options: {0}")]
    Config(#[from] ConfigError),

    /// A platform call failed.
    #[error("os({about}): {err}")]
    Os {
        /// What was being attempted.
        about: &'static str,

        #[source]
        err: io::Error,
    },

    /// The child was asked to run before it was placed in a container.
    #[error("child process cannot be resumed from state {0:?}")]
    NotContained(LaunchState),

    /// No java executable could be found under the given home or on the PATH.
    #[error("java executable not found (looked in {})", .0.display())]
    JavaNotFound(PathBuf),

    /// The launcher configuration failed validation.
    #[error("configuration: {0}")]
    Builder(String),
}

impl Error {
    /// Adapter for `map_err` that tags an I/O error with what was attempted.
    pub fn os(about: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |err| Self::Os { about, err }
    }

    /// Tags the calling thread's last OS error.
    pub fn last_os(about: &'static str) -> Self {
        Self::Os {
            about,
            err: io::Error::last_os_error(),
        }
    }
}

/// Errors produced while reading an options document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read options file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("circular include of options file {}", .0.display())]
    CircularInclude(PathBuf),

    #[error("error parsing {} line: {line}", .path.display())]
    Line {
        path: PathBuf,
        line: String,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    /// Whether this error, or any error it wraps, is an include cycle.
    pub fn is_circular(&self) -> bool {
        match self {
            Self::CircularInclude(_) => true,
            Self::Line { source, .. } => source.is_circular(),
            Self::Read { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_adapter_keeps_context() {
        let err = Error::os("create job object")(io::Error::from(io::ErrorKind::PermissionDenied));
        let text = err.to_string();
        assert!(text.starts_with("os(create job object): "), "{}", text);
    }

    #[test]
    fn nested_cycle_is_detected_through_line_context() {
        let err = ConfigError::Line {
            path: "a.vmoptions".into(),
            line: "-include-options b.vmoptions".into(),
            source: Box::new(ConfigError::Line {
                path: "b.vmoptions".into(),
                line: "-include-options a.vmoptions".into(),
                source: Box::new(ConfigError::CircularInclude("a.vmoptions".into())),
            }),
        };
        assert!(err.is_circular());

        let read = ConfigError::Read {
            path: "missing".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(!read.is_circular());
    }
}
