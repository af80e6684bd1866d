//! CLI flags for the `evote-server` binary: verbosity flags, a `--config`
//! path, and a migrate-only ops mode, expressed with `clap`'s derive API.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "evote-server", about = "eVote job-orchestration core")]
pub struct CliOpts {
	/// Path to a TOML config file overriding the built-in defaults.
	#[arg(short, long, env = "EVOTE_CONFIG")]
	pub config: Option<PathBuf>,

	/// Increase log verbosity; repeatable (-v, -vv, -vvv).
	#[arg(short, long, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Run embedded migrations against the configured database and exit
	/// without starting the scheduler, workers, or HTTP server.
	#[arg(long)]
	pub migrate_only: bool,

	/// Override the HTTP bind address from the config file.
	#[arg(long, env = "EVOTE_BIND_ADDR")]
	pub bind_addr: Option<String>,
}

impl CliOpts {
	pub fn parse_args() -> Self {
		Self::parse()
	}

	/// Maps repeated `-v` flags onto a `log::LevelFilter`.
	pub fn log_level(&self) -> log::LevelFilter {
		match self.verbose {
			0 => log::LevelFilter::Info,
			1 => log::LevelFilter::Info,
			2 => log::LevelFilter::Debug,
			_ => log::LevelFilter::Trace,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verbosity_ladder_maps_flag_count_to_level() {
		let mut opts = CliOpts { config: None, verbose: 0, migrate_only: false, bind_addr: None };
		assert_eq!(opts.log_level(), log::LevelFilter::Info);
		opts.verbose = 3;
		assert_eq!(opts.log_level(), log::LevelFilter::Trace);
	}
}
