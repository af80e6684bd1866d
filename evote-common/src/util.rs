//! logging and general utilities

use std::path::{Path, PathBuf};

#[cfg(feature = "logging")]
use fern::colors::{Color, ColoredLevelConfig};

use crate::error::Error;

#[cfg(feature = "logging")]
pub fn init_logger(std: log::LevelFilter, file: log::LevelFilter) -> Result<(), Error> {
	let colors = ColoredLevelConfig::new()
		.info(Color::Green)
		.warn(Color::Yellow)
		.error(Color::Red)
		.debug(Color::Blue)
		.trace(Color::Magenta);

	let mut log_dir = app_dir()?;
	create_dir(log_dir.as_path())?;
	log_dir.push("evote.log");

	let stdout_dispatcher = fern::Dispatch::new()
		.level_for("evote_core", std)
		.level_for("evote_queue", std)
		.level_for("evote_api", std)
		.level_for("sqlx", log::LevelFilter::Warn)
		.level_for("lapin", log::LevelFilter::Warn)
		.level_for("reqwest", log::LevelFilter::Warn)
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {} {}",
				chrono::Local::now().format("[%H:%M]"),
				colors.color(record.level()),
				message,
			))
		})
		.chain(fern::Dispatch::new().level(std).chain(std::io::stdout()));

	let file_dispatcher = fern::Dispatch::new()
		.level(file)
		.level_for("sqlx", log::LevelFilter::Warn)
		.level_for("lapin", log::LevelFilter::Warn)
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} [{}][{}] {}::{};{}",
				chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
				record.target(),
				record.level(),
				message,
				format_opt(record.file().map(|s| s.to_string())),
				format_opt(record.line().map(|n| n.to_string()))
			))
		})
		.chain(fern::log_file(log_dir).expect("failed to create evote.log file"));

	fern::Dispatch::new().chain(stdout_dispatcher).chain(file_dispatcher).apply().expect("could not init logging");
	Ok(())
}

fn format_opt(file: Option<String>) -> String {
	match file {
		None => "".to_string(),
		Some(f) => f,
	}
}

/// Path to a local directory where eVote can save its logs and any
/// on-disk state. Uses the platform data-local directory.
pub fn app_dir() -> Result<PathBuf, Error> {
	if let Some(base_dirs) = dirs::BaseDirs::new() {
		let mut path = base_dirs.data_local_dir().to_path_buf();
		path.push("evote");
		Ok(path)
	} else {
		Err(Error::from("no valid home directory path could be retrieved from the operating system"))
	}
}

/// Create an arbitrary directory on disk, tolerating it already existing.
pub fn create_dir(path: &Path) -> Result<(), Error> {
	if let Err(e) = std::fs::create_dir_all(path) {
		match e.kind() {
			std::io::ErrorKind::AlreadyExists => (),
			_ => return Err(Error::from(format!("directory '{:?}' could not be created", path))),
		}
	}
	Ok(())
}
