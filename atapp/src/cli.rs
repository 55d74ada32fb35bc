// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Command-line binding
//!
//! `program [global-flags] <command> [args…]`. Commands are mutually
//! exclusive: `start` runs the node, while `stop`, `reload` and `run`
//! deliver the corresponding command to an already-running instance over
//! its first listen address and print the response lines. `info` prints
//! identity/version facts and exits.

use clap::{Parser, Subcommand};

use crate::app::{App, RunMode};
use crate::errors::AppError;

#[derive(Debug, Subcommand)]
enum Command {
    /// Initialize and run this node
    Start,
    /// Ask the running instance to stop
    Stop {
        /// Keep the pid file in place for an in-place upgrade
        #[arg(long)]
        upgrade: bool,
    },
    /// Ask the running instance to reload its configuration
    Reload {
        /// Keep the pid file in place for an in-place upgrade
        #[arg(long)]
        upgrade: bool,
    },
    /// Send a custom command to the running instance and print the
    /// response lines
    Run {
        /// Command words
        #[arg(trailing_var_arg = true)]
        words: Vec<String>,
    },
    /// Print identity and version information
    Info,
}

/// Global options accepted ahead of the command.
#[derive(Debug, Parser)]
#[command(name = "atapp", disable_version_flag = true)]
struct CliArgs {
    /// Node id, plain or dotted (interpreted against the id mask)
    #[arg(long = "id")]
    id: Option<String>,

    /// Dotted id mask, e.g. 8.8.8.8
    #[arg(long = "id-mask")]
    id_mask: Option<String>,

    /// Configuration file
    #[arg(short = 'c', long = "conf", visible_alias = "config")]
    conf: Option<std::path::PathBuf>,

    /// Pid file path
    #[arg(short = 'p', long = "pid")]
    pid: Option<std::path::PathBuf>,

    /// Run in upgrade mode (keep the pid file across stop/reload)
    #[arg(long)]
    upgrade: bool,

    /// Startup log target: stdout, stderr or a file path
    #[arg(long = "startup-log")]
    startup_log: Option<String>,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

impl App {
    /// Bind command-line arguments onto this app, deciding the run mode.
    pub fn parse_options<I, T>(&mut self, args: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let parsed = match CliArgs::try_parse_from(args) {
            Ok(parsed) => parsed,
            Err(err) => {
                // clap renders help/usage itself
                let _ = err.print();
                self.mode = RunMode::Help;
                return Ok(());
            }
        };

        self.id_override = parsed.id;
        self.id_mask_override = parsed.id_mask;
        if let Some(conf) = parsed.conf {
            self.set_conf_file(conf);
        }
        if let Some(pid) = parsed.pid {
            self.set_pid_file(pid);
        }
        self.upgrade_mode = parsed.upgrade;
        self.startup_log = parsed.startup_log;

        if parsed.version {
            self.mode = RunMode::Info;
            println!("{}", self.version_text());
            return Ok(());
        }

        self.mode = match parsed.command {
            Some(Command::Start) => RunMode::Start,
            Some(Command::Stop { upgrade }) => {
                self.upgrade_mode = self.upgrade_mode || upgrade;
                RunMode::Stop
            }
            Some(Command::Reload { upgrade }) => {
                self.upgrade_mode = self.upgrade_mode || upgrade;
                RunMode::Reload
            }
            Some(Command::Run { words }) => {
                self.last_command = words;
                RunMode::Custom
            }
            Some(Command::Info) => {
                println!("{}", self.info_text());
                RunMode::Info
            }
            None => {
                let _ = CliArgs::try_parse_from(["atapp", "--help"]).map_err(|err| err.print());
                RunMode::Help
            }
        };
        Ok(())
    }

    fn version_text(&self) -> String {
        if self.get_build_version().is_empty() {
            format!("atapp {}", self.get_app_version())
        } else {
            format!(
                "atapp {} (build {})",
                self.get_app_version(),
                self.get_build_version()
            )
        }
    }

    fn info_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.version_text());
        out.push('\n');
        out.push_str(&format!("id: {}\n", self.get_id()));
        out.push_str(&format!("name: {}\n", self.get_app_name()));
        out.push_str(&format!(
            "type: {}:{}\n",
            self.get_type_id(),
            self.get_type_name()
        ));
        out.push_str(&format!("identity: {}", self.get_app_identity()));
        out
    }

    /// Full CLI driver: parse the arguments, run the selected mode, and
    /// map the result to a process exit code (`0` success, negative
    /// taxonomy code on failure).
    pub fn run_with_args<I, T>(&mut self, args: I) -> i32
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        if let Err(err) = self.parse_options(args) {
            return err.code();
        }
        match self.run() {
            Ok(()) => 0,
            Err(err) => err.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_mode_with_flags() {
        let mut app = App::new();
        app.parse_options([
            "atapp", "--id", "0x12", "--id-mask", "8.8.8.8", "-c", "/tmp/a.yaml", "start",
        ])
        .expect("parse");
        assert_eq!(RunMode::Start, app.run_mode());
    }

    #[test]
    fn stop_with_upgrade_keeps_flag() {
        let mut app = App::new();
        app.parse_options(["atapp", "stop", "--upgrade"]).expect("parse");
        assert_eq!(RunMode::Stop, app.run_mode());
        assert!(app.is_current_upgrade_mode());
    }

    #[test]
    fn run_collects_words() {
        let mut app = App::new();
        app.parse_options(["atapp", "run", "hello", "world"])
            .expect("parse");
        assert_eq!(RunMode::Custom, app.run_mode());
    }

    #[test]
    fn no_command_prints_help() {
        let mut app = App::new();
        app.parse_options(["atapp"]).expect("parse");
        assert_eq!(RunMode::Help, app.run_mode());
    }
}
