//! Command-line driver for the playback engine.
//!
//! Plays the given files and URLs in order through one [`PlayerSession`],
//! with next-track precaching between consecutive local files. Events are
//! logged; Ctrl-C (or SIGTERM) stops playback and exits cleanly.

use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use tremolo::{
    config::Config,
    decoder::registry::Registry,
    device::AudioDevice,
    error::Result,
    events::EventSink,
    outbuf::{OutputBuffer, PCM_BUF_SIZE},
    player::PlayerSession,
    signal,
};

/// Build profile indicator for logging.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";

/// Build profile indicator for logging.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Default, PartialEq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files or URLs to play, in order
    #[arg(required = true, value_name = "FILE", value_hint = ValueHint::FilePath)]
    files: Vec<String>,

    /// Path to a configuration file
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, env = "TREMOLO_CONFIG")]
    config: Option<String>,

    /// Audio output specification: [<host>][|<device>]
    #[arg(short, long, default_value_t = String::new(), env = "TREMOLO_DEVICE")]
    device: String,

    /// Stop after the first track instead of advancing
    #[arg(long)]
    no_autonext: bool,

    /// Quiet; no logging
    #[arg(short, long, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Verbose logging
    #[arg(short, long, group = ARGS_GROUP_LOGGING)]
    verbose: bool,
}

/// Initializes the logger based on the verbosity flags.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose {
            "debug"
        } else if args.quiet {
            "off"
        } else {
            "info"
        }),
    );

    if args.verbose {
        logger.filter_module("symphonia", LevelFilter::Info);
    }
    logger.init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    info!(
        "starting {} {} ({BUILD_PROFILE})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
    );

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };
    if args.no_autonext {
        config.autonext = false;
    }

    let mut registry = Registry::with_builtin_plugins();
    registry.set_mime_magic(config.use_mime_magic);
    registry.set_preferences(&config.preferred_decoders);
    let registry = Arc::new(registry);

    let out_buf = Arc::new(OutputBuffer::new(4 * PCM_BUF_SIZE));
    let device = Arc::new(AudioDevice::new(&args.device, Arc::clone(&out_buf))?);

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let session = Arc::new(PlayerSession::new(
        registry,
        device,
        out_buf,
        config.clone(),
        EventSink::new(event_tx),
    ));

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!("event: {event:?}");
        }
    });

    let quit = Arc::new(AtomicBool::new(false));
    {
        let session = Arc::clone(&session);
        let quit = Arc::clone(&quit);
        tokio::spawn(async move {
            match signal::shutdown().await {
                Ok(signal) => {
                    info!("received {signal}, stopping playback");
                    quit.store(true, Ordering::SeqCst);
                    session.stop();
                }
                Err(e) => error!("cannot listen for shutdown signals: {e}"),
            }
        });
    }

    let mut position = 0;
    while position < args.files.len() && !quit.load(Ordering::SeqCst) {
        let file = args.files[position].clone();
        let next = args.files.get(position + 1).cloned();

        info!("playing {file}");
        let player = Arc::clone(&session);
        tokio::task::spawn_blocking(move || player.play(&file, next.as_deref()))
            .await
            .map_err(|e| tremolo::error::Error::internal(e.to_string()))?;

        if !config.autonext {
            break;
        }
        position += 1;
    }

    info!("done");
    Ok(())
}
