use std::{error::Error, io, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use spotnik::{
    config::Config,
    events::LogSink,
    player::PlayerClient,
    scheduler::{LogPresenter, Scheduler},
    store::FileTokenStore,
    token::TokenManager,
    transport,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Default file the refresh token is persisted to.
const DEFAULT_REFRESH_TOKEN_FILE: &str = "refresh_token";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Secrets file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains the client secret that can grant access to your Spotify
    /// application.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Refresh token file
    ///
    /// Where the refresh token is persisted between runs. When this file
    /// exists and holds a valid token, no new authorization is needed.
    #[arg(short = 't', long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from(DEFAULT_REFRESH_TOKEN_FILE))]
    refresh_token_file: String,

    /// Base interval between playback polls, in milliseconds
    #[arg(short, long, value_name = "MILLIS", default_value_t = 5_000)]
    polling_delay: u64,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the configuration from the secrets file.
fn load_config(args: &Args) -> io::Result<Config> {
    let config = Config::from_secrets_file(&args.secrets_file);

    if let Err(ref e) = config {
        if e.kind() == io::ErrorKind::NotFound {
            info!(
                "read the documentation on how to set up {}",
                args.secrets_file
            );
        }
    }

    config
}

/// Main application loop.
///
/// # Errors
///
/// Returns an error when the configuration cannot be loaded or the TLS
/// connector cannot be built. Network and service errors after startup are
/// absorbed by the scheduler.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(&args)?;
    config.polling_delay = Duration::from_millis(args.polling_delay);
    let polling_delay = config.polling_delay;

    let sink = Arc::new(LogSink::new());
    let client = Arc::new(transport::Client::new(sink.clone())?);
    let store = Arc::new(FileTokenStore::new(&args.refresh_token_file));

    let tokens = TokenManager::new(config.clone(), client.clone(), store, sink.clone());
    if tokens.has_refresh_token() {
        info!("resuming with the stored refresh token");
    } else {
        info!("no refresh token; authorize the application to begin");
    }

    let player = PlayerClient::new(config, client, sink);
    let mut scheduler = Scheduler::new(tokens, player, Arc::new(LogPresenter), polling_delay);

    // Input sources would hold a clone of this and post actions from their
    // own tasks.
    let _handle = scheduler.handle();

    tokio::select! {
        // Prioritize shutdown signals.
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("shutting down gracefully");
            Ok(())
        }

        () = scheduler.run() => unreachable!("scheduler loop never returns"),
    }
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and starts the main application loop.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
