//! CLI entry point for trellix-epo.
//!
//! Loads the tenant profile, opens an authenticated session and dispatches
//! to one of the subcommands:
//!
//! - `apply-tag`: apply or clear a tag on devices listed in a file.
//! - `pull-events`: forward new threat events to a file and/or syslog,
//!   periodically until interrupted.
//! - `properties`: collect device properties as JSON or CSV.
//! - `products`: collect installed products as JSON or CSV.
//!
//! Exit codes:
//! - 0: success
//! - 1: runtime error (auth failure, API error, rejected tag change, etc.)
//! - 2: argument validation error (clap handles this automatically)

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use trellix_epo::client::EpoClient;
use trellix_epo::config::{self, DEFAULT_PROFILE, Profile};
use trellix_epo::error::Result;
use trellix_epo::events::EventFeed;
use trellix_epo::properties;
use trellix_epo::report;
use trellix_epo::sink::EventSink;
use trellix_epo::workflows::{self, ALL, TagAction, TagSummary};

/// Default wait between two event pulls.
const DEFAULT_PULL_INTERVAL_SECS: u64 = 600;

/// Wait after a pull that stopped on a failing page.
const STALLED_PULL_BACKOFF: Duration = Duration::from_secs(60);

const LOG_FILE_NAME: &str = "trellix-epo.log";

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Tenant profile (TOML). `EPO_*` environment variables override its keys.
    #[arg(long, global = true, env = "EPO_PROFILE", default_value = DEFAULT_PROFILE)]
    profile: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` wins.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply (or clear) an existing tag on every device listed in FILE.
    ApplyTag {
        /// Tag name. The tag must already exist in ePO.
        tag: String,

        /// File with one device name per line.
        file: PathBuf,

        /// Clear the tag instead of applying it.
        #[arg(short, long)]
        clear: bool,

        /// List all devices once and send a single request for every device
        /// whose tag state needs changing.
        #[arg(long)]
        batch: bool,
    },

    /// Pull new threat events and forward them to a file and/or syslog.
    PullEvents(PullArgs),

    /// Collect device properties.
    Properties {
        /// Comma-separated property names, or `all`.
        props: String,

        /// File with one device name per line, or `all` for every device.
        target: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        output: OutputFormat,
    },

    /// Collect installed Trellix products per device.
    Products {
        /// File with one device name per line.
        file: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        output: OutputFormat,
    },
}

/// Event destinations: at least one of `--file` / `--server` is required,
/// and `--server` and `--port` go together.
#[derive(clap::Args)]
#[command(group(
    ArgGroup::new("destination")
        .required(true)
        .multiple(true)
        .args(["file", "server"])
))]
struct PullArgs {
    /// Append events to this file, one JSON object per line.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Syslog server receiving one UDP datagram per event.
    #[arg(short, long, requires = "port")]
    server: Option<String>,

    /// Syslog server port.
    #[arg(short, long, requires = "server")]
    port: Option<u16>,

    /// Seconds to wait between pulls.
    #[arg(long, default_value_t = DEFAULT_PULL_INTERVAL_SECS)]
    interval: u64,

    /// Pull once and exit instead of looping.
    #[arg(long)]
    once: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

/// Installs the global subscriber. Logs go to `<log_dir>/trellix-epo.log`
/// when a directory is configured, to stderr otherwise. The returned guard
/// must live until exit so buffered file logs are flushed.
fn init_tracing(verbose: u8, default_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => default_level,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = config::load_profile(&cli.profile);
    let (level, log_dir) = match &loaded {
        Ok(profile) => (profile.log_level.clone(), profile.log_path.clone()),
        Err(_) => ("info".to_string(), None),
    };
    let _guard = init_tracing(cli.verbose, &level, log_dir.as_deref());

    let profile = match loaded {
        Ok(profile) => profile,
        Err(e) => {
            error!(profile = %cli.profile.display(), error = %e, "unable to load profile");
            return ExitCode::FAILURE;
        }
    };
    debug!(?profile, "profile loaded");

    match run(&cli, &profile).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "command failed");
            let mut source = std::error::Error::source(&e);
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = std::error::Error::source(cause);
            }
            ExitCode::FAILURE
        }
    }
}

/// Runs the selected subcommand. `Ok(false)` means the command completed
/// but some of its work was refused.
async fn run(cli: &Cli, profile: &Profile) -> Result<bool> {
    let client = EpoClient::open(profile).await?;

    match &cli.command {
        Command::ApplyTag {
            tag,
            file,
            clear,
            batch,
        } => {
            let devices = workflows::read_device_names(file).await?;
            let action = if *clear { TagAction::Clear } else { TagAction::Apply };
            info!(devices = devices.len(), ?action, tag = %tag, "tagging devices");

            let summary = if *batch {
                workflows::tag_devices_in_batch(&client, tag, &devices, action).await?
            } else {
                workflows::tag_each_device(&client, tag, &devices, action).await?
            };
            log_summary(&summary);
            Ok(summary.is_success())
        }

        Command::PullEvents(args) => {
            pull_events(&client, profile, &cli.profile, args).await?;
            Ok(true)
        }

        Command::Properties {
            props,
            target,
            output,
        } => {
            let selection = workflows::parse_selection(props)?;
            let rows = if target.eq_ignore_ascii_case(ALL) {
                properties::collect_all_properties(&client, &selection).await?
            } else {
                let devices = workflows::read_device_names(Path::new(target)).await?;
                workflows::device_properties(&client, &devices, &selection).await?
            };
            let rendered = match output {
                OutputFormat::Json => report::render_json(&rows)?,
                OutputFormat::Csv => report::properties_csv(&rows)?,
            };
            print_report(&rendered, rows.is_empty());
            Ok(true)
        }

        Command::Products { file, output } => {
            let devices = workflows::read_device_names(file).await?;
            let inventory = workflows::device_inventory(&client, &devices).await?;
            let rendered = match output {
                OutputFormat::Json => report::render_json(&inventory)?,
                OutputFormat::Csv => report::products_csv(&inventory)?,
            };
            print_report(&rendered, inventory.is_empty());
            Ok(true)
        }
    }
}

fn print_report(rendered: &str, empty: bool) {
    if empty && rendered.is_empty() {
        println!("No data found");
    } else {
        print!("{rendered}");
        if !rendered.ends_with('\n') {
            println!();
        }
    }
}

fn log_summary(summary: &TagSummary) {
    info!(
        changed = summary.changed,
        already_satisfied = summary.already_satisfied,
        "tagging done"
    );
    if !summary.not_found.is_empty() {
        warn!(devices = ?summary.not_found, "devices not found in system tree");
    }
    if !summary.ambiguous.is_empty() {
        warn!(devices = ?summary.ambiguous, "device names matching several devices were skipped");
    }
    if !summary.rejected.is_empty() {
        error!(devices = ?summary.rejected, "tag change rejected");
    }
}

/// Pulls and forwards events until Ctrl-C (or once with `--once`).
///
/// The session is refreshed before every cycle since the wait between
/// pulls can outlive a token. Only the waits race Ctrl-C: a pull in
/// progress always finishes so that events behind a persisted cursor are
/// written out.
async fn pull_events(
    client: &EpoClient,
    profile: &Profile,
    profile_path: &Path,
    args: &PullArgs,
) -> Result<()> {
    let mut feed = EventFeed::from_profile(profile, profile_path)?;
    let syslog = args.server.as_deref().zip(args.port);
    let mut sink = EventSink::open(args.file.as_deref(), syslog).await?;
    info!("starting threat event collection");

    loop {
        client.reauthenticate().await?;
        let batch = feed.pull_new_events(client).await?;
        let written = sink.write_all(&batch.events).await?;
        info!(written, "threat events forwarded");

        if args.once {
            return Ok(());
        }

        let wait = if batch.is_stalled() {
            warn!(status = ?batch.stalled, "event pull stalled, backing off");
            STALLED_PULL_BACKOFF
        } else {
            Duration::from_secs(args.interval)
        };
        debug!(?wait, "waiting until next pull");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping threat event collection");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn apply_tag_parses_positionals_and_flags() {
        let cli = Cli::try_parse_from(["trellix-epo", "apply-tag", "Quarantine", "hosts.txt", "-c", "--batch"])
            .expect("should parse apply-tag");
        match cli.command {
            Command::ApplyTag {
                tag,
                file,
                clear,
                batch,
            } => {
                assert_eq!(tag, "Quarantine");
                assert_eq!(file, PathBuf::from("hosts.txt"));
                assert!(clear);
                assert!(batch);
            }
            _ => panic!("expected apply-tag"),
        }
    }

    #[test]
    fn apply_tag_requires_file() {
        assert!(Cli::try_parse_from(["trellix-epo", "apply-tag", "Quarantine"]).is_err());
    }

    #[test]
    fn profile_defaults_and_overrides() {
        let cli = Cli::try_parse_from(["trellix-epo", "products", "hosts.txt"]).unwrap();
        // EPO_PROFILE may be set in the environment running the tests.
        if std::env::var_os("EPO_PROFILE").is_none() {
            assert_eq!(cli.profile, PathBuf::from(DEFAULT_PROFILE));
        }

        let cli = Cli::try_parse_from([
            "trellix-epo",
            "products",
            "hosts.txt",
            "--profile",
            "/etc/trellix/prod.toml",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.profile, PathBuf::from("/etc/trellix/prod.toml"));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn pull_events_requires_a_destination() {
        let result = Cli::try_parse_from(["trellix-epo", "pull-events"]);
        assert!(result.is_err(), "file or server must be given");
    }

    #[test]
    fn pull_events_server_requires_port() {
        assert!(Cli::try_parse_from(["trellix-epo", "pull-events", "-s", "10.0.0.5"]).is_err());
        assert!(Cli::try_parse_from(["trellix-epo", "pull-events", "-f", "ev.log", "-p", "514"]).is_err());
    }

    #[test]
    fn pull_events_parses_both_destinations() {
        let cli = Cli::try_parse_from([
            "trellix-epo",
            "pull-events",
            "-f",
            "events.log",
            "-s",
            "10.0.0.5",
            "-p",
            "514",
            "--once",
        ])
        .unwrap();
        match cli.command {
            Command::PullEvents(args) => {
                assert_eq!(args.file, Some(PathBuf::from("events.log")));
                assert_eq!(args.server.as_deref(), Some("10.0.0.5"));
                assert_eq!(args.port, Some(514));
                assert_eq!(args.interval, DEFAULT_PULL_INTERVAL_SECS);
                assert!(args.once);
            }
            _ => panic!("expected pull-events"),
        }
    }

    #[test]
    fn properties_output_defaults_to_json() {
        let cli = Cli::try_parse_from(["trellix-epo", "properties", "name,ipAddress", "all"]).unwrap();
        match cli.command {
            Command::Properties {
                props,
                target,
                output,
            } => {
                assert_eq!(props, "name,ipAddress");
                assert_eq!(target, "all");
                assert_eq!(output, OutputFormat::Json);
            }
            _ => panic!("expected properties"),
        }
    }

    #[test]
    fn unknown_output_format_is_rejected() {
        assert!(Cli::try_parse_from(["trellix-epo", "products", "hosts.txt", "-o", "xml"]).is_err());
        let cli = Cli::try_parse_from(["trellix-epo", "products", "hosts.txt", "-o", "csv"]).unwrap();
        assert!(matches!(cli.command, Command::Products { output: OutputFormat::Csv, .. }));
    }
}
