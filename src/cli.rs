use std::{env, ffi::OsString, path::PathBuf};

use clap::{App, Arg};

use crate::config::{Config, ConfigBuilder, DEFAULT_MAIN_CLASS};
use crate::error::{Error, Result};

/// Parses the process arguments. Exits with usage on bad arguments.
///
/// Returns the launcher configuration and the `-v` count.
pub fn get_args() -> Result<(Config, u64)> {
    get_args_from(env::args_os())
}

pub fn get_args_from<I, T>(from: I) -> Result<(Config, u64)>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = App::new("oie-launcher")
        .version(crate_version!())
        .about("Run the Open Integration Engine server as a supervised child process")
        .after_help("Arguments after -- are passed to the server.")
        .arg(Arg::with_name("base-dir")
            .help("Installation directory [default: the launcher's directory]")
            .short("d")
            .long("base-dir")
            .takes_value(true)
            .value_name("dir"))
        .arg(Arg::with_name("options")
            .help("Options file to read [default: <base-dir>/oieserver.vmoptions]")
            .short("o")
            .long("options")
            .takes_value(true)
            .value_name("file"))
        .arg(Arg::with_name("main-class")
            .help("Java class to run")
            .long("main-class")
            .takes_value(true)
            .value_name("class")
            .default_value(DEFAULT_MAIN_CLASS))
        .arg(Arg::with_name("classpath")
            .help("Initial classpath entry, before the options file applies [default: <base-dir>/mirth-server-launcher.jar]")
            .long("classpath")
            .number_of_values(1)
            .multiple(true)
            .takes_value(true)
            .value_name("entry"))
        .arg(Arg::with_name("java-home")
            .help("Java installation to use [default: <base-dir>/jre, then JAVA_HOME, then PATH]")
            .long("java-home")
            .takes_value(true)
            .value_name("dir"))
        .arg(Arg::with_name("verbose")
            .help("Print debugging messages to stderr")
            .short("v")
            .long("verbose")
            .multiple(true))
        .arg(Arg::with_name("args")
            .help("Arguments for the server")
            .multiple(true)
            .last(true))
        .get_matches_from_safe(from)
        .unwrap_or_else(|e| e.exit());

    let base_dir = match args.value_of_os("base-dir") {
        Some(dir) => PathBuf::from(dir),
        None => launcher_dir()?,
    };

    let mut builder = ConfigBuilder::default();
    builder
        .base_dir(base_dir)
        .main_class(args.value_of("main-class").unwrap_or(DEFAULT_MAIN_CLASS))
        .args(values_t!(args.values_of("args"), String).unwrap_or_default());

    if let Some(options) = args.value_of_os("options") {
        builder.options_file(PathBuf::from(options));
    }
    if let Ok(classpath) = values_t!(args.values_of("classpath"), String) {
        builder.classpath(classpath);
    }
    if let Some(home) = args.value_of_os("java-home") {
        builder.java_home(PathBuf::from(home));
    }

    let config = builder.build().map_err(Error::Builder)?;
    Ok((config, args.occurrences_of("verbose")))
}

fn launcher_dir() -> Result<PathBuf> {
    let exe = env::current_exe().map_err(Error::os("locate launcher"))?;
    Ok(exe
        .parent()
        .map_or_else(|| PathBuf::from("."), |dir| dir.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn minimal_arguments_use_defaults() {
        let (config, verbosity) = get_args_from(&["oie-launcher", "-d", "/opt/oie"]).unwrap();
        assert_eq!(verbosity, 0);
        assert_eq!(config.base_dir, Path::new("/opt/oie"));
        assert_eq!(config.main_class, DEFAULT_MAIN_CLASS);
        assert_eq!(config.options_file, None);
        assert_eq!(config.classpath, None);
        assert!(config.args.is_empty());
    }

    #[test]
    fn everything_can_be_overridden() {
        let (config, verbosity) = get_args_from(&[
            "oie-launcher",
            "--base-dir", "/opt/oie",
            "--options", "/etc/oie/custom.vmoptions",
            "--main-class", "org.example.Main",
            "--classpath", "a.jar",
            "--classpath", "b.jar",
            "--java-home", "/usr/lib/jvm/17",
            "-vv",
            "--", "-k", "start",
        ])
        .unwrap();

        assert_eq!(verbosity, 2);
        assert_eq!(config.options_file.as_deref(), Some(Path::new("/etc/oie/custom.vmoptions")));
        assert_eq!(config.main_class, "org.example.Main");
        assert_eq!(config.classpath, Some(vec!["a.jar".to_string(), "b.jar".to_string()]));
        assert_eq!(config.java_home.as_deref(), Some(Path::new("/usr/lib/jvm/17")));
        assert_eq!(config.args, vec!["-k".to_string(), "start".to_string()]);
    }

    #[test]
    fn base_dir_defaults_to_launcher_directory() {
        let (config, _) = get_args_from(&["oie-launcher"]).unwrap();
        let exe = env::current_exe().unwrap();
        assert_eq!(Some(config.base_dir.as_path()), exe.parent());
    }
}
