//! Configuration for the launcher.
//!
//! The [`Config`] struct is not constructable, use [`ConfigBuilder`].
//!
//! # Examples
//!
//! ```
//! # use oie_launcher::config::ConfigBuilder;
//! ConfigBuilder::default()
//!     .base_dir("/opt/oie")
//!     .args(vec!["-k".to_string()])
//!     .build()
//!     .expect("mission failed");
//! ```

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::java::java_executable;
use crate::options::OptionsDocument;
use crate::supervisor::Invocation;

/// Entry point of the server.
pub const DEFAULT_MAIN_CLASS: &str = "com.mirth.connect.server.launcher.MirthLauncher";

/// Options file read from the installation directory when none is given.
pub const DEFAULT_OPTIONS_FILE: &str = "oieserver.vmoptions";

/// Classpath the options file starts from.
pub const DEFAULT_LAUNCHER_JAR: &str = "mirth-server-launcher.jar";

/// Java runtime bundled with the installation, if there is one.
pub const BUNDLED_JRE: &str = "jre";

/// Arguments to the launcher
#[derive(Builder, Clone, Debug)]
#[builder(setter(into, strip_option))]
#[builder(build_fn(validate = "Self::validate"))]
#[non_exhaustive]
pub struct Config {
    /// Installation directory; the server runs here.
    pub base_dir: PathBuf,
    /// Root options file. Defaults to `oieserver.vmoptions` in `base_dir`.
    #[builder(default)]
    pub options_file: Option<PathBuf>,
    /// Java class to run.
    #[builder(default = "DEFAULT_MAIN_CLASS.into()")]
    pub main_class: String,
    /// Classpath before the options file changes it. Defaults to the launcher
    /// jar in `base_dir`.
    #[builder(default)]
    pub classpath: Option<Vec<String>>,
    /// Java installation to use. Defaults to the bundled `jre` if present,
    /// else `JAVA_HOME`, else whatever `java` is on the PATH.
    #[builder(default)]
    pub java_home: Option<PathBuf>,
    /// Extra arguments for the server.
    #[builder(default)]
    pub args: Vec<String>,
}

impl ConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if self
            .base_dir
            .as_ref()
            .map_or(true, |dir| dir.as_os_str().is_empty())
        {
            return Err("base_dir must not be empty".into());
        }

        if self.main_class.as_ref().map_or(false, String::is_empty) {
            return Err("main_class must not be empty".into());
        }

        Ok(())
    }
}

impl Config {
    pub fn options_file(&self) -> PathBuf {
        self.options_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join(DEFAULT_OPTIONS_FILE))
    }

    pub fn classpath_seed(&self) -> Vec<String> {
        self.classpath.clone().unwrap_or_else(|| {
            vec![self
                .base_dir
                .join(DEFAULT_LAUNCHER_JAR)
                .to_string_lossy()
                .into_owned()]
        })
    }

    pub fn java_home(&self) -> Option<PathBuf> {
        self.java_home.clone().or_else(|| {
            let bundled = self.base_dir.join(BUNDLED_JRE);
            if bundled.is_dir() {
                Some(bundled)
            } else {
                None
            }
        })
    }

    /// Reads the options file and works out the full command to run.
    ///
    /// A `-java-cmd` in the options file takes precedence over java discovery.
    pub fn invocation(&self) -> Result<Invocation> {
        let mut doc = OptionsDocument::with_classpath(self.classpath_seed());
        doc.add_file(self.options_file())?;

        let command = match doc.java_cmd() {
            Some(cmd) => relative_to(&self.base_dir, Path::new(cmd)),
            None => java_executable(self.java_home().as_deref())?,
        };
        debug!("Using java at {}", command.display());

        Ok(Invocation {
            command,
            args: doc.invocation(&self.main_class, &self.args),
            working_dir: self.base_dir.clone(),
        })
    }
}

/// A relative path with a directory part is taken from `base`; a bare name
/// is left for a PATH search.
fn relative_to(base: &Path, cmd: &Path) -> PathBuf {
    if cmd.is_relative() && cmd.components().count() > 1 {
        base.join(cmd)
    } else {
        cmd.to_path_buf()
    }
}
