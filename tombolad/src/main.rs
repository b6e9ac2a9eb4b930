use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use tombola::bets::BetStore;
use tombola::config::{ServerConfig, DEFAULT_CONFIG_FILE};
use tombola::logging;
use tombola::monitor::LotteryMonitor;
use tombola::server::Server;

const EXIT_CONFIG_FAILURE: i32 = 1;
const EXIT_BIND_FAILURE: i32 = 2;

#[derive(Parser)]
#[command(name = "tombolad", about = "Lottery bet aggregation server")]
struct Options {
    /// Path to the configuration file.
    #[arg(long = "config", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() {
    let options = Options::parse();

    let config = match ServerConfig::load(&options.config) {
        Ok(config) => config,
        Err(err) => {
            // The configured level is unavailable, log the failure at a fixed one.
            logging::error!(logging::init("error"), "configuration failed"; "error" => ?err);
            process::exit(EXIT_CONFIG_FAILURE);
        }
    };

    let log = logging::init(&config.logging_level);

    logging::debug!(log, "configuration loaded";
                    "context" => "startup",
                    "port" => config.port,
                    "listen_backlog" => config.listen_backlog,
                    "number_of_agencies" => config.number_of_agencies,
                    "logging_level" => config.logging_level.as_str(),
                    "storage_file" => %config.storage_file.display());

    let store = BetStore::new(&config.storage_file);
    let monitor = Arc::new(LotteryMonitor::new(store, &log));

    let server = match Server::bind(&config, monitor, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "bind failed";
                            "context" => "startup", "port" => config.port, "error" => ?err);
            process::exit(EXIT_BIND_FAILURE);
        }
    };

    let handle = server.shutdown_handle();
    let mut signals = match Signals::new(&[SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(err) => {
            logging::error!(log, "signal registration failed"; "context" => "startup", "error" => ?err);
            process::exit(EXIT_CONFIG_FAILURE);
        }
    };

    let signal_log = log.new(logging::o!());
    thread::spawn(move || {
        for signal in signals.forever() {
            logging::info!(signal_log, "signal received"; "context" => "shutdown", "signal" => signal);
            handle.shutdown();
        }
    });

    server.run();

    logging::info!(log, "server stopped"; "context" => "shutdown");
}
