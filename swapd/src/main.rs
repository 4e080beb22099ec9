
#[macro_use] extern crate anyhow;
#[macro_use] extern crate log;

use std::io;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::Parser;

use swapd::{Config, Server};
use swapd_log::{RecordSerializeWrapper, SLOG_TARGET};


/// Name of the file with structured logs in the log dir.
const SLOG_FILENAME: &str = "slog.json";

#[derive(Parser)]
#[command(name = "swapd", version, about)]
struct Cli {
	/// Path to the configuration file
	#[arg(global = true, short = 'C', long)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
	/// Create the database and the key material of the server
	#[command()]
	Create,

	/// Start the server
	#[command()]
	Start,

	/// Print the effective configuration
	#[command()]
	DumpConfig,
}

#[tokio::main]
async fn main() {
	// Set a custom panic hook to make sure we print stack traces
	// when one of our background processes panic.
	std::panic::set_hook(Box::new(|panic_info| {
		let backtrace = std::backtrace::Backtrace::force_capture();
		eprintln!("Panic occurred: {}\n\nBacktrace:\n{}", panic_info, backtrace);
	}));

	if let Err(e) = inner_main().await {
		eprintln!("An error occurred: {}", e);
		eprintln!("");
		eprintln!("{:?}", e);
		process::exit(1);
	}
}

fn init_logging(slog_dir: Option<&Path>) -> anyhow::Result<()> {
	let mut dispatch = fern::Dispatch::new()
		.level(log::LevelFilter::Trace)
		.level_for("bitcoincore_rpc", log::LevelFilter::Warn)
		.level_for("tokio_postgres", log::LevelFilter::Info)
		// regular logging dispatch
		.chain(fern::Dispatch::new()
			.format(|out, msg, rec| {
				let now = chrono::Local::now();
				let stamp = now.to_rfc3339();
				let data = rec.key_values().get("slog_data".into())
					.and_then(|d| serde_json::to_string(&d).ok())
					.map(|d| format!(" -- {}", d))
					.unwrap_or_default();
				out.finish(format_args!(
					"[{} {: >5} {}] {}{}",
					stamp, rec.level(), rec.module_path().unwrap_or(""), msg, data,
				))
			})
			.chain(io::stdout())
		);

	if let Some(dir) = slog_dir {
		std::fs::create_dir_all(dir).context("failed to create log dir")?;
		// structured logging dispatch
		let slog_file = fern::log_file(dir.join(SLOG_FILENAME)).context("failed to open log file")?;
		dispatch = dispatch.chain(fern::Dispatch::new()
			.filter(|m| m.target() == SLOG_TARGET)
			.format(|out, _msg, rec| {
				#[derive(serde::Serialize)]
				struct Rec<'a> {
					timestamp: chrono::DateTime<chrono::Local>,
					#[serde(flatten)]
					rec: RecordSerializeWrapper<'a>,
				}
				let rec = Rec {
					timestamp: chrono::Local::now(),
					rec: RecordSerializeWrapper(rec),
				};
				match serde_json::to_string(&rec) {
					Ok(line) => out.finish(format_args!("{}", line)),
					Err(e) => out.finish(format_args!("{{\"error\":\"unserializable record: {}\"}}", e)),
				}
			})
			.chain(slog_file)
		);
	}

	dispatch.apply().context("error setting up logging")?;
	Ok(())
}

async fn inner_main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let cfg = Config::load(cli.config.as_ref().map(|p| p.as_path()))?;
	cfg.validate().context("invalid configuration")?;

	if let Command::DumpConfig = cli.command {
		cfg.write_into(&mut io::stdout())?;
		return Ok(());
	}

	init_logging(cfg.log_dir.as_ref().map(|p| p.as_path()))?;
	info!("Running with config: {:#?}", cfg);

	match cli.command {
		Command::DumpConfig => unreachable!(),
		Command::Create => {
			Server::create(cfg).await?;
		}
		Command::Start => {
			if let Err(e) = Server::run(cfg).await {
				error!("Shutdown error from server {:?}", e);
				bail!("server stopped with an error");
			}
		}
	}

	Ok(())
}
