//! Unified logging and progress UI.
//!
//! [`Notifier`] wraps `env_logger` (text logs) and `indicatif` (a live spinner) under a single
//! verbosity switch:
//! - [`VerbosityLevel::Quiet`] → no text logs below warn; shows a live spinner instead.
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`] → standard logs.
//!
//! Levels map to `env_logger` filters; the global logger is initialized once so plain
//! `log::debug!`-style calls from any module land in the same sink.

use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Spinner, no text logs
    Info = 1,  // Text logs at info level
    Debug = 2, // Text logs at debug level
    Trace = 3, // Text logs at trace level
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    multi_progress: Option<MultiProgress>,
    active_spinner: Mutex<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);

        env_logger::Builder::from_env(Env::default())
            .filter_level(verbosity.to_log_level())
            .try_init()
            .ok();

        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(MultiProgress::new())
        } else {
            None
        };

        Self {
            verbosity,
            multi_progress,
            active_spinner: Mutex::new(None),
        }
    }

    pub fn finish_spinner(&self) {
        if let Some(spinner) = self.active_spinner.lock().unwrap().take() {
            spinner.finish_and_clear();
        }
    }

    pub fn info(&self, message: &str) {
        match self.verbosity {
            VerbosityLevel::Quiet => {
                let mut active = self.active_spinner.lock().unwrap();

                // Lazy initialize the spinner on first info call
                if active.is_none() {
                    if let Some(multi_progress) = &self.multi_progress {
                        let spinner_style = ProgressStyle::default_spinner()
                            .template("{spinner:.green} {msg}")
                            .unwrap();

                        let spinner = multi_progress.add(ProgressBar::new_spinner());
                        spinner.set_style(spinner_style);
                        spinner.enable_steady_tick(Duration::from_millis(100));

                        *active = Some(spinner);
                    }
                }

                if let Some(spinner) = active.as_ref() {
                    spinner.set_message(message.to_string());
                }
            }
            _ => log::info!("{message}"),
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            log::debug!("{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        log::warn!("{message}");
    }

    pub fn error(&self, message: &str) {
        log::error!("{message}");
    }

    /// Logs the message and terminates the process. Reserved for conditions where
    /// continuing would make things worse (unreachable hosts, rate limiting).
    pub fn fatal(&self, message: &str) -> ! {
        self.finish_spinner();
        log::error!("{message}");
        std::process::exit(1);
    }

    pub fn verbosity_level(&self) -> VerbosityLevel {
        self.verbosity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(VerbosityLevel::from(0), VerbosityLevel::Quiet);
        assert_eq!(VerbosityLevel::from(1), VerbosityLevel::Info);
        assert_eq!(VerbosityLevel::from(2), VerbosityLevel::Debug);
        assert_eq!(VerbosityLevel::from(7), VerbosityLevel::Trace);
    }

    #[test]
    fn test_quiet_mode_has_progress() {
        let notifier = Notifier::new(0);
        assert!(notifier.multi_progress.is_some());
        assert_eq!(notifier.verbosity_level(), VerbosityLevel::Quiet);

        let notifier = Notifier::new(2);
        assert!(notifier.multi_progress.is_none());
    }
}
