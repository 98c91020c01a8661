use chrono::Local;
use colored::Colorize;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

const LOG_DIR: &str = "logs";

/// Appends a timestamped message to a log file under `logs/`.
///
/// # Arguments
///
/// * `filename` - The name of the log file (created on first use)
/// * `message` - The message to log
pub fn log_to_file(filename: &str, message: &str) -> io::Result<()> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let path = format!("{}/{}", LOG_DIR, filename);

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    writeln!(file, "[{}] {}", timestamp, message)?;
    file.flush()?;

    Ok(())
}

/// Appends a row to a CSV file under `logs/`, writing the header first if
/// the file is new.
pub fn log_csv(filename: &str, headers: &[&str], data: &[&str]) -> io::Result<()> {
    if !Path::new(LOG_DIR).exists() {
        std::fs::create_dir_all(LOG_DIR)?;
    }

    let path = format!("{}/{}", LOG_DIR, filename);
    let file_exists = Path::new(&path).exists();

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

    let to_io = |e: csv::Error| io::Error::new(io::ErrorKind::Other, e);
    if !file_exists && !headers.is_empty() {
        writer.write_record(headers).map_err(to_io)?;
    }
    writer.write_record(data).map_err(to_io)?;
    writer.flush()?;

    Ok(())
}

/// Prints a tagged status line when verbose output is enabled.
pub fn console(verbose: bool, tag: &str, message: &str) {
    if verbose {
        println!("{} {}", tag.green().bold(), message);
    }
}

/// Prints a tagged warning line when verbose output is enabled.
pub fn console_warn(verbose: bool, tag: &str, message: &str) {
    if verbose {
        println!("{} {}", tag.yellow().bold(), message);
    }
}
