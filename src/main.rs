use std::process;

use oie_launcher::{cli, error::Result, run};

fn main() {
    process::exit(match launch() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("*** {}", err);
            1
        }
    })
}

fn launch() -> Result<i32> {
    let (config, verbosity) = cli::get_args()?;
    run::init_logger(verbosity);

    // a server killed by a signal has no exit code of its own
    Ok(run(config)?.and_then(|status| status.code()).unwrap_or(1))
}
