//! Parser for `.vmoptions` files.
//!
//! An options file is line-oriented: blank lines and lines starting with `#`
//! are skipped, a handful of directives manipulate the classpath, the java
//! command, or pull in other files, and every other line is passed to the
//! JVM verbatim. `${NAME}` references are replaced with the value of the
//! environment variable `NAME` (or nothing, if it is unset).
//!
//! ```text
//! # memory
//! -Xmx2g
//! -include-options ${OIE_CONF}/extra.vmoptions
//! -classpath/a lib/custom.jar
//! ```

use std::{
    borrow::Cow,
    collections::HashSet,
    env,
    fs::File,
    io::{BufRead, BufReader},
    path::{Component, Path, PathBuf},
};

use regex::{Captures, Regex};

use crate::error::ConfigError;

#[cfg(unix)]
pub const CLASSPATH_SEPARATOR: &str = ":";
#[cfg(not(unix))]
pub const CLASSPATH_SEPARATOR: &str = ";";

lazy_static! {
    static ref ENV_REFERENCE: Regex =
        Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("env reference pattern is valid");
}

/// Replaces every `${NAME}` in `s` with the value of the environment variable.
pub fn substitute_env(s: &str) -> Cow<'_, str> {
    substitute_with(s, |name| {
        env::var_os(name).map(|value| value.to_string_lossy().into_owned())
    })
}

fn substitute_with<F>(s: &str, lookup: F) -> Cow<'_, str>
where
    F: Fn(&str) -> Option<String>,
{
    if !s.contains("${") {
        return Cow::Borrowed(s);
    }

    ENV_REFERENCE.replace_all(s, |caps: &Captures| lookup(&caps[1]).unwrap_or_default())
}

/// The flattened result of an options file and everything it includes.
#[derive(Clone, Debug, Default)]
pub struct OptionsDocument {
    vm_options: Vec<String>,
    classpath: Vec<String>,
    java_cmd: Option<String>,
    parsed_files: HashSet<String>,
}

impl OptionsDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a document whose classpath is already populated, typically with
    /// the launcher jar.
    pub fn with_classpath(classpath: Vec<String>) -> Self {
        Self {
            classpath,
            ..Self::default()
        }
    }

    /// Parses `path` and its includes into a fresh document.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut doc = Self::new();
        doc.add_file(path)?;
        Ok(doc)
    }

    pub fn vm_options(&self) -> &[String] {
        &self.vm_options
    }

    pub fn classpath(&self) -> &[String] {
        &self.classpath
    }

    /// The `-java-cmd` override, if any file set one.
    pub fn java_cmd(&self) -> Option<&str> {
        self.java_cmd.as_deref()
    }

    /// Reads one options file into this document, recursing into includes.
    ///
    /// A file may only be read once per document: seeing it again means the
    /// includes form a cycle.
    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let identity = file_identity(path)?;
        if !self.parsed_files.insert(identity) {
            return Err(ConfigError::CircularInclude(path.to_path_buf()));
        }

        debug!("Reading options file {:?}", path);
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

            self.add_option(&line, base_dir)
                .map_err(|source| ConfigError::Line {
                    path: path.to_path_buf(),
                    line: line.clone(),
                    source: Box::new(source),
                })?;
        }

        Ok(())
    }

    /// Applies a single line, read from a file living in `base_dir`.
    pub fn add_option(&mut self, line: &str, base_dir: &Path) -> Result<(), ConfigError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }

        let (directive, rest) = match line.find(' ') {
            Some(idx) => (&line[..idx], line[idx + 1..].trim()),
            None => (line, ""),
        };

        match directive {
            "-include-options" => {
                let include = base_dir.join(substitute_env(rest).as_ref());
                self.add_file(include)?;
            }
            "-java-cmd" => {
                self.java_cmd = Some(substitute_env(rest).into_owned());
            }
            "-classpath" => {
                self.classpath.clear();
                self.classpath.push(substitute_env(rest).into_owned());
            }
            "-classpath/a" => {
                self.classpath.push(substitute_env(rest).into_owned());
            }
            "-classpath/p" => {
                self.classpath.insert(0, substitute_env(rest).into_owned());
            }
            _ => {
                self.vm_options.push(substitute_env(line).into_owned());
            }
        }

        Ok(())
    }

    /// JVM arguments: options, `-cp <classpath>`, the main class, then the
    /// server's own arguments.
    pub fn invocation<S: AsRef<str>>(&self, main_class: &str, app_args: &[S]) -> Vec<String> {
        let mut command = Vec::with_capacity(self.vm_options.len() + app_args.len() + 3);
        command.extend(self.vm_options.iter().cloned());
        command.push("-cp".into());
        command.push(self.classpath.join(CLASSPATH_SEPARATOR));
        command.push(main_class.into());
        command.extend(app_args.iter().map(|arg| arg.as_ref().to_owned()));
        command
    }
}

/// Case-insensitive key for an options file, independent of how it was reached.
fn file_identity(path: &Path) -> Result<String, ConfigError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .join(path)
    };

    let mut normal = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other.as_os_str()),
        }
    }

    Ok(normal.to_string_lossy().to_lowercase())
}
