//! Crash diagnostics for unattended sensor deployments.
//!
//! The producer path treats unrecoverable conditions as panics, so a
//! crashed recorder in the field needs a readable trace. The hook appends
//! a timestamped report to the data directory before the process dies.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic;
use std::path::PathBuf;

/// Install the crash-report panic hook. Call early in `main`.
pub fn install() {
    if std::env::var("RUST_BACKTRACE").is_err() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let report = format!(
            "[{}] audiosonde {} panicked: {}\nbacktrace:\n{}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            env!("CARGO_PKG_VERSION"),
            info,
            std::backtrace::Backtrace::force_capture()
        );

        if let Some(path) = crash_log_path() {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
                let _ = file.write_all(report.as_bytes());
                let _ = file.flush();
                eprintln!("Crash report appended to: {}", path.display());
            }
        }

        default_hook(info);
    }));
}

fn crash_log_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "sondeworks", "audiosonde")
        .map(|dirs| dirs.data_dir().join("crash.log"))
}
