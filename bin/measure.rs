use std::{
    io,
    path::PathBuf,
    process::{Command, ExitCode, ExitStatus},
    str::FromStr,
};

use argh::FromArgs;
use colored::Colorize;
use env_logger::Env;
use tirex_tracker::{
    format, Measure, Results, TrackError, TrackedProcess, Tracker, TrackerConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Simple,
    Json,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Format::Simple),
            "json" => Ok(Format::Json),
            other => Err(format!("unknown format '{other}', expected simple or json")),
        }
    }
}

/// Runs a command and reports the hardware, software and resources it used.
#[derive(FromArgs)]
struct Args {
    /// output format: simple (default) or json
    #[argh(option, short = 'f', default = "Format::Simple")]
    format: Format,

    /// regex selecting the providers to enable, may be repeated
    #[argh(option, short = 'p')]
    provider: Vec<String>,

    /// polling interval of continuously sampled providers in milliseconds
    #[argh(option, short = 'i')]
    poll_interval_ms: Option<u64>,

    /// TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// log more details, repeat for info, debug and trace
    #[argh(switch, short = 'v')]
    verbose: u8,

    /// log nothing
    #[argh(switch, short = 'q')]
    quiet: bool,

    /// list the providers and measures, then exit
    #[argh(switch)]
    list: bool,

    /// the command to run, through the system shell
    #[argh(positional, greedy)]
    command: Vec<String>,
}

impl Args {
    fn config(&self) -> Result<TrackerConfig, tirex_tracker::Error> {
        let mut config = match &self.config {
            Some(path) => TrackerConfig::load(path)?,
            None => TrackerConfig::default(),
        };
        config.apply_env();
        if !self.provider.is_empty() {
            config.providers = self.provider.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        Ok(config)
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Log level for `-v` given `verbose` times, on a warning baseline.
fn log_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "off";
    }
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[derive(Debug)]
enum Failure {
    Spawn(io::Error),
    Tracker(tirex_tracker::Error),
    Wait(io::Error),
}

/// Spawns `command` and tracks it, as a child of this process, until it exits.
fn measure(mut config: TrackerConfig, command: &str) -> Result<(Results, ExitStatus), Failure> {
    let mut child = shell(command).spawn().map_err(Failure::Spawn)?;
    log::debug!("running `{command}` as pid {}", child.id());
    config.process = TrackedProcess::Child(child.id());

    let tracked = Tracker::new(config)
        .map_err(TrackError::Tracker)
        .and_then(|tracker| tracker.try_track(Measure::ALL, || child.wait()));
    match tracked {
        Ok(tracked) => Ok(tracked),
        Err(TrackError::Work(e)) => Err(Failure::Wait(e)),
        Err(TrackError::Tracker(e)) => {
            if let Err(kill) = child.kill().and_then(|()| child.wait()) {
                log::warn!("cannot stop `{command}`: {kill}");
            }
            Err(Failure::Tracker(e))
        }
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    match status.code() {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        // terminated by a signal
        None => ExitCode::FAILURE,
    }
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();

    let level = log_level(args.verbose, args.quiet);
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    if args.list {
        print!("{}", format::catalog());
        return ExitCode::SUCCESS;
    }
    if args.command.is_empty() {
        eprintln!("{}", "no command given, see --help".red());
        return ExitCode::from(2);
    }

    let config = match args.config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.to_string().red());
            return ExitCode::from(2);
        }
    };

    let command = args.command.join(" ");
    let (results, status) = match measure(config, &command) {
        Ok(measured) => measured,
        Err(Failure::Spawn(e)) => {
            eprintln!("{}", format!("cannot run `{command}`: {e}").red());
            return ExitCode::from(127);
        }
        Err(Failure::Wait(e)) => {
            eprintln!("{}", format!("lost track of `{command}`: {e}").red());
            return ExitCode::FAILURE;
        }
        Err(Failure::Tracker(e)) => {
            eprintln!("{}", e.to_string().red());
            return ExitCode::from(2);
        }
    };

    match args.format {
        Format::Simple => print!("{}", format::simple(&results)),
        Format::Json => println!("{}", format::json(&results)),
    }
    exit_code(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_is_counted() {
        assert_eq!(log_level(0, false), "warn");
        assert_eq!(log_level(1, false), "info");
        assert_eq!(log_level(2, false), "debug");
        assert_eq!(log_level(3, false), "trace");
        assert_eq!(log_level(7, false), "trace");
        assert_eq!(log_level(2, true), "off");

        let args = Args::from_args(&["measure"], &["-v", "-v", "--", "true"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.command, vec!["true"]);
    }

    #[test]
    #[cfg(unix)]
    fn reports_the_busy_child() {
        let config = TrackerConfig {
            providers: vec!["time|cpu".into()],
            ..TrackerConfig::default()
        };
        let (results, status) = measure(
            config,
            "i=0; while [ $i -lt 200000 ]; do i=$((i+1)); done",
        )
        .unwrap();

        assert!(status.success());
        let user = results.get(Measure::TimeElapsedUserMs).unwrap().as_f64().unwrap();
        assert!(user > 0.0);
        let cpu = results.get(Measure::CpuUsedProcessPercent).unwrap().as_f64().unwrap();
        assert!(cpu > 0.0);
    }

    #[test]
    #[cfg(unix)]
    fn exit_status_is_forwarded() {
        let config = TrackerConfig {
            providers: vec!["time".into()],
            ..TrackerConfig::default()
        };
        let (_, status) = measure(config, "exit 3").unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn invalid_config_stops_the_child() {
        let config = TrackerConfig {
            providers: vec!["(".into()],
            ..TrackerConfig::default()
        };
        assert!(matches!(
            measure(config, "sleep 5"),
            Err(Failure::Tracker(tirex_tracker::Error::ProviderFilter { .. }))
        ));
    }
}
