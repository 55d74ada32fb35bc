// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Process lifecycle: configure, initialize, run, reload, stop
//!
//! The deterministic sequence is: `parse_options` decides the run mode,
//! `init` loads configuration and walks every module through
//! setup/reload/init/ready, then the main loop alternates between waiting
//! (tick timer, signals, connector events) and draining. A stop request
//! flips the `Stopping` flag; modules are polled cooperatively until they
//! drain or the stop timeout escalates to the forced path.

use std::path::PathBuf;
use std::time::Instant;

use super::{App, AppFlag};
use crate::config::loader;
use crate::errors::AppError;
use crate::identity;
use crate::message::MessageSender;
use crate::pidfile;

/// POSIX `_POSIX_SIGQUEUE_MAX` is 32 on most platforms; signals beyond
/// this many pending are dropped.
pub(crate) const MAX_SIGNAL_COUNT: usize = 32;

/// What the process was asked to do, decided by the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Deliver an arbitrary custom command to a running instance
    Custom,
    /// Initialize and run the main loop
    Start,
    /// Ask a running instance to stop
    Stop,
    /// Ask a running instance to reload
    Reload,
    /// Print information and exit
    Info,
    /// Print help and exit
    Help,
}

// ========================= Signals ========================= //

#[cfg(unix)]
pub(crate) struct SignalHub {
    term: tokio::signal::unix::Signal,
    ignored: Vec<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl SignalHub {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let term = signal(SignalKind::terminate())?;
        // replacing the default disposition is what "ignore" means here;
        // the streams are drained and dropped on the floor
        let ignored = vec![
            signal(SignalKind::interrupt())?,
            signal(SignalKind::hangup())?,
            signal(SignalKind::pipe())?,
            signal(SignalKind::from_raw(libc_signal::SIGTSTP))?,
            signal(SignalKind::from_raw(libc_signal::SIGTTIN))?,
            signal(SignalKind::from_raw(libc_signal::SIGTTOU))?,
        ];
        Ok(Self { term, ignored })
    }

    /// Wait for any registered signal; returns a non-zero signo for
    /// signals that need processing.
    pub(crate) async fn wait(&mut self) -> i32 {
        let term = &mut self.term;
        let ignored = &mut self.ignored;
        std::future::poll_fn(|cx| {
            if term.poll_recv(cx).is_ready() {
                return std::task::Poll::Ready(libc_signal::SIGTERM);
            }
            for sig in ignored.iter_mut() {
                if sig.poll_recv(cx).is_ready() {
                    return std::task::Poll::Ready(0);
                }
            }
            std::task::Poll::Pending
        })
        .await
    }
}

#[cfg(unix)]
mod libc_signal {
    pub const SIGTERM: i32 = 15;
    pub const SIGTSTP: i32 = 20;
    pub const SIGTTIN: i32 = 21;
    pub const SIGTTOU: i32 = 22;
}

#[cfg(not(unix))]
pub(crate) struct SignalHub;

#[cfg(not(unix))]
impl SignalHub {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub(crate) async fn wait(&mut self) -> i32 {
        std::future::pending().await
    }
}

// ========================= Lifecycle ========================= //

impl App {
    /// Override the configuration file before `init`.
    pub fn set_conf_file(&mut self, path: impl Into<PathBuf>) {
        self.conf_file = Some(path.into());
    }

    /// Override the pid file before `init`.
    pub fn set_pid_file(&mut self, path: impl Into<PathBuf>) {
        self.pid_file = Some(path.into());
    }

    /// The run mode decided by the command line (Start by default).
    pub fn run_mode(&self) -> RunMode {
        self.mode
    }

    /// Initialize the app: load configuration, set up signals, logging and
    /// listeners, and drive every module through setup/reload/init/ready.
    ///
    /// In the non-`Start` modes this instead delivers the corresponding
    /// command to the running instance and returns.
    pub async fn init(&mut self) -> Result<(), AppError> {
        if self.check_flag(AppFlag::Initialized) {
            return Err(AppError::AlreadyInited);
        }
        if self.check_flag(AppFlag::InCallback) {
            return Ok(());
        }

        self.last_tick = Instant::now();
        self.setup_startup_log();

        match self.mode {
            RunMode::Info | RunMode::Help => return Ok(()),
            _ => {}
        }

        self.reload()?;

        match self.mode {
            RunMode::Start => {}
            RunMode::Custom | RunMode::Stop | RunMode::Reload => {
                return self.send_last_command().await;
            }
            RunMode::Info | RunMode::Help => return Ok(()),
        }

        if let Err(err) = self.setup_signal() {
            tracing::error!("setup signal failed: {err}");
            self.write_pidfile();
            return Err(AppError::SetupTimer);
        }

        // all modules setup
        for index in 0..self.modules.len() {
            if !self.modules[index].enabled {
                continue;
            }
            let module = self.modules[index].module.clone();
            let result = module.borrow_mut().setup(&self.config);
            if let Err(err) = result {
                tracing::error!(
                    "setup module {} failed: {err}",
                    module.borrow().name()
                );
                self.write_pidfile();
                return Err(err);
            }
        }

        self.setup_log();
        self.setup_timer();
        self.setup_bus()?;

        // all modules reload
        for index in 0..self.modules.len() {
            if !self.modules[index].enabled {
                continue;
            }
            let module = self.modules[index].module.clone();
            let result = module.borrow_mut().reload(&self.config);
            if let Err(err) = result {
                tracing::error!(
                    "load configure of {} failed: {err}",
                    module.borrow().name()
                );
                self.write_pidfile();
                return Err(err);
            }
        }

        // all modules init; partial failure rolls back in reverse order
        let mut failed: Option<AppError> = None;
        let mut inited_index = 0;
        while inited_index < self.modules.len() {
            if self.modules[inited_index].enabled {
                let module = self.modules[inited_index].module.clone();
                let result = module.borrow_mut().init(self);
                if let Err(err) = result {
                    tracing::error!(
                        "initialize {} failed: {err}",
                        module.borrow().name()
                    );
                    failed = Some(err);
                    break;
                }
                self.modules[inited_index].active = true;
                self.last_proc_event_count += 1;
            }
            inited_index += 1;
        }
        if let Some(err) = failed {
            let mut rollback = inited_index;
            loop {
                let module = self.modules[rollback].module.clone();
                module.borrow_mut().cleanup();
                if rollback == 0 {
                    break;
                }
                rollback -= 1;
            }
            self.write_pidfile();
            return Err(err);
        }

        self.trigger_event_on_all_modules_ready();

        if !self.write_pidfile() {
            return Err(AppError::WritePidFile);
        }

        self.set_flag(AppFlag::Stopped, false);
        self.set_flag(AppFlag::Stopping, false);
        self.set_flag(AppFlag::Initialized, true);
        self.set_flag(AppFlag::Running, true);

        for index in 0..self.modules.len() {
            if !self.modules[index].enabled {
                continue;
            }
            let module = self.modules[index].module.clone();
            module.borrow_mut().ready(self);
        }

        Ok(())
    }

    /// Reload configuration. Idempotent; running modules get their
    /// `reload` hook, and a changed tick interval schedules a timer reset.
    pub fn reload(&mut self) -> Result<(), AppError> {
        let old_tick_interval = self.config.timer.tick_interval;
        tracing::warn!("============ start to load configure ============");

        let Some(conf_file) = self.conf_file.clone() else {
            tracing::error!("missing configure file");
            return Err(AppError::MissingConfigureFile);
        };

        let incoming = loader::load_app_config(&conf_file)?;
        self.apply_configure(incoming);

        if self.mode != RunMode::Start {
            return Ok(());
        }

        if self.is_running() {
            self.setup_log();
            for index in 0..self.modules.len() {
                if !self.modules[index].enabled {
                    continue;
                }
                let module = self.modules[index].module.clone();
                let result = module.borrow_mut().reload(&self.config);
                if let Err(err) = result {
                    tracing::error!(
                        "reload module {} failed: {err}",
                        module.borrow().name()
                    );
                }
            }
        }

        if old_tick_interval != self.config.timer.tick_interval {
            self.set_flag(AppFlag::ResetTimer, true);
        }

        tracing::warn!("------------ load configure done ------------");
        Ok(())
    }

    /// Apply a configuration tree directly, bypassing file loading.
    /// Identity freezing applies exactly as on a file reload. Intended
    /// for embedders and tests that build their configuration in code.
    pub fn setup_configure(&mut self, config: crate::config::AppConfig) {
        self.apply_configure(config);
    }

    fn apply_configure(&mut self, incoming: crate::config::AppConfig) {
        let old_name = std::mem::take(&mut self.config.name);
        let old_hostname = std::mem::take(&mut self.config.hostname);
        let old_identity = std::mem::take(&mut self.config.identity);

        self.config = incoming;

        // id and id mask; command-line overrides win
        let mask_text = self
            .id_mask_override
            .clone()
            .unwrap_or_else(|| self.config.id_mask.clone());
        self.id_mask = identity::split_ids_by_string(&mask_text);

        let id_text = self
            .id_override
            .clone()
            .unwrap_or_else(|| self.config.id.clone());
        self.resolved_id = identity::convert_app_id_by_string(&id_text, &self.id_mask);

        // changing name is not allowed
        if !old_name.is_empty() {
            self.config.name = old_name;
        } else if self.config.name.is_empty() {
            self.config.name = identity::default_node_name(&self.config.type_name, self.resolved_id);
        }

        self.hash_code =
            crate::identity::NameHash::digest(self.config.name.as_bytes()).to_hex();

        // changing hostname is not allowed
        if !old_hostname.is_empty() {
            self.config.hostname = old_hostname;
        } else if self.config.hostname.is_empty() {
            self.config.hostname = identity::local_hostname().to_string();
        }

        // changing identity is not allowed
        if !old_identity.is_empty() {
            self.config.identity = old_identity;
        } else if self.config.identity.is_empty() {
            let conf_file = self.conf_file.clone().unwrap_or_default();
            self.config.identity = identity::identity_digest(
                &self.execute_path,
                &conf_file,
                self.resolved_id,
                &self.config.name,
                &self.config.hostname,
            );
        }

        self.matcher = crate::gateway::GatewayMatcher::new(
            self.config.hostname.clone(),
            self.config.metadata.clone(),
        );
        self.context()
            .set_identity(self.resolved_id, &self.config.name);
    }

    /// Request a cooperative stop. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.check_flag(AppFlag::Stopping) {
            tracing::warn!(
                "============= recall stop after some event action(s) finished ============="
            );
        } else {
            tracing::warn!(
                "============ receive stop signal and ready to stop all modules ============"
            );
        }
        self.set_flag(AppFlag::Stopping, true);
    }

    /// Run the main loop on a fresh current-thread runtime until the app
    /// fully stops.
    pub fn run(&mut self) -> Result<(), AppError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                tracing::error!("failed to build runtime: {err}");
                AppError::SetupTimer
            })?;
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, self.run_async())
    }

    /// Run the main loop inside an existing `LocalSet`.
    pub async fn run_async(&mut self) -> Result<(), AppError> {
        if self.check_flag(AppFlag::InCallback) {
            return Ok(());
        }
        if self.is_closed() {
            return Err(AppError::AlreadyClosed);
        }
        if !self.check_flag(AppFlag::Initialized) {
            self.init().await?;
        }
        if self.mode != RunMode::Start {
            return Ok(());
        }

        while !self.is_closed() {
            self.run_inner().await?;
        }
        Ok(())
    }

    /// Run pending work without blocking: drain connector events and run a
    /// tick pass. Intended for embedding and tests.
    pub fn run_noblock(&mut self) -> i32 {
        self.last_proc_event_count = 0;
        let events = self.process_core_events();
        self.tick();
        events + self.last_proc_event_count as i32
    }

    async fn run_inner(&mut self) -> Result<(), AppError> {
        if !self.check_flag(AppFlag::Initialized) {
            return Err(AppError::NotInited);
        }
        self.last_proc_event_count = 0;

        enum Wake {
            Tick,
            StopTimeout,
            Signal(i32),
            Event(crate::connector::CoreEvent),
            EventChannelClosed,
        }

        let tick_deadline = self.next_tick_at;
        let stop_deadline = self.stop_deadline;
        let wake = {
            let events = &mut self.events_rx;
            let signals = self.signals.as_mut();
            let stop_sleep = async {
                match stop_deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };
            let signal_wait = async {
                match signals {
                    Some(hub) => hub.wait().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = tokio::time::sleep_until(tick_deadline.into()) => Wake::Tick,
                _ = stop_sleep => Wake::StopTimeout,
                signo = signal_wait => Wake::Signal(signo),
                event = events.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::EventChannelClosed,
                },
            }
        };

        match wake {
            Wake::Tick => {}
            Wake::StopTimeout => {
                self.set_flag(AppFlag::Timeout, true);
            }
            Wake::Signal(signo) => self.enqueue_signal(signo),
            // handled ahead of the drain below so channel order holds
            Wake::Event(event) => {
                self.handle_core_event(event);
                self.last_proc_event_count += 1;
            }
            Wake::EventChannelClosed => {}
        }

        if self.check_flag(AppFlag::ResetTimer) {
            self.setup_timer();
        }

        self.process_signals();

        let events = self.process_core_events();
        if events > 0 {
            self.last_proc_event_count += events as u64;
        }

        let now = Instant::now();
        if now >= self.next_tick_at || self.check_flag(AppFlag::Stopping) {
            self.tick();
            let interval = self.config.timer.effective_tick_interval();
            self.next_tick_at = now + interval;
        }

        if self.check_flag(AppFlag::Stopping) {
            self.shutdown_drain();
        }

        if self.is_closed() && self.is_inited() {
            self.finalize();
        }

        Ok(())
    }

    fn shutdown_drain(&mut self) {
        self.set_flag(AppFlag::Stopped, true);

        if self.check_flag(AppFlag::Timeout) {
            for index in 0..self.modules.len() {
                if !self.modules[index].enabled {
                    continue;
                }
                let module = self.modules[index].module.clone();
                tracing::error!("try to stop module {} but timeout", module.borrow().name());
                module.borrow_mut().timeout();
                self.modules[index].enabled = false;
            }
        } else {
            for index in 0..self.modules.len() {
                if !self.modules[index].enabled {
                    continue;
                }
                let module = self.modules[index].module.clone();
                let result = module.borrow_mut().stop(self);
                if result == 0 {
                    self.modules[index].enabled = false;
                } else if result < 0 {
                    self.modules[index].enabled = false;
                    tracing::error!(
                        "try to stop module {} but failed and return {result}",
                        module.borrow().name()
                    );
                } else {
                    // the module still wants ticks; keep draining
                    self.set_flag(AppFlag::Stopped, false);
                }
            }

            if !self.check_flag(AppFlag::Stopped) && self.stop_deadline.is_none() {
                self.stop_deadline = Some(Instant::now() + self.config.timer.stop_timeout);
            }
        }

        if self.check_flag(AppFlag::Stopped) {
            for connector in self.connectors.clone() {
                connector.borrow_mut().shutdown();
            }
        }
    }

    fn finalize(&mut self) {
        self.stop_deadline = None;

        // cleanup modules in reverse order
        for index in (0..self.modules.len()).rev() {
            let module = self.modules[index].module.clone();
            module.borrow_mut().cleanup();
        }

        // drop every endpoint, cancelling what they still buffer
        let leftovers: Vec<_> = self.endpoints_by_id.values().cloned().collect();
        for endpoint in leftovers {
            self.remove_endpoint(&endpoint);
        }
        let leftovers: Vec<_> = self.endpoints_by_name.values().cloned().collect();
        for endpoint in leftovers {
            self.remove_endpoint(&endpoint);
        }
        self.waker.clear();

        self.cleanup_pidfile();

        self.set_flag(AppFlag::Initialized, false);
        self.set_flag(AppFlag::Running, false);
    }

    // ========================= Signals ========================= //

    fn setup_signal(&mut self) -> std::io::Result<()> {
        self.signals = Some(SignalHub::new()?);
        Ok(())
    }

    pub(crate) fn enqueue_signal(&mut self, signo: i32) {
        if signo == 0 {
            return;
        }
        if self.pending_signals.len() >= MAX_SIGNAL_COUNT {
            return;
        }
        self.pending_signals.push(signo);
    }

    pub(crate) fn process_signals(&mut self) {
        if self.pending_signals.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_signals);
        for signo in pending {
            self.process_signal(signo);
        }
    }

    fn process_signal(&mut self, signo: i32) {
        #[cfg(unix)]
        if signo == libc_signal::SIGTERM {
            self.upgrade_mode = false;
            self.stop();
        }
        #[cfg(not(unix))]
        let _ = signo;
    }

    // ========================= Timer, log, bus ========================= //

    pub(crate) fn setup_timer(&mut self) {
        self.set_flag(AppFlag::ResetTimer, false);
        let interval = self.config.timer.effective_tick_interval();
        if self.config.timer.tick_interval < crate::config::MIN_TICK_INTERVAL {
            tracing::warn!(
                "tick interval can not be smaller than 1ms, we use default {}ms now.",
                crate::config::DEFAULT_TICK_INTERVAL.as_millis()
            );
        } else {
            tracing::info!("setup tick interval to {}ms.", interval.as_millis());
        }
        self.next_tick_at = Instant::now() + interval;
    }

    fn setup_startup_log(&self) {
        use tracing_subscriber::fmt::writer::BoxMakeWriter;

        let writer = match self.startup_log.as_deref() {
            None | Some("stdout") => BoxMakeWriter::new(std::io::stdout),
            Some("stderr") => BoxMakeWriter::new(std::io::stderr),
            Some(path) => match std::fs::File::create(path) {
                Ok(file) => BoxMakeWriter::new(std::sync::Arc::new(file)),
                Err(err) => {
                    eprintln!("failed to open startup log {path}: {err}");
                    BoxMakeWriter::new(std::io::stderr)
                }
            },
        };

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .try_init();
    }

    pub(crate) fn setup_log(&self) {
        let filter = tracing_subscriber::EnvFilter::try_new(&self.config.log.level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        // the subscriber can only be installed once per process; reloads
        // that keep the same level are no-ops
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    fn setup_bus(&mut self) -> Result<(), AppError> {
        for address in self.config.bus.listen.clone() {
            if let Err(err) = self.listen(&address) {
                tracing::error!("listen on {address} failed: {err}");
                return Err(AppError::SetupBus);
            }
        }
        Ok(())
    }

    // ========================= Last command ========================= //

    async fn send_last_command(&mut self) -> Result<(), AppError> {
        let words: Vec<String> = match self.mode {
            RunMode::Stop => {
                let mut words = vec!["stop".to_string()];
                if self.upgrade_mode {
                    words.push("--upgrade".to_string());
                }
                words
            }
            RunMode::Reload => vec!["reload".to_string()],
            _ => self.last_command.clone(),
        };
        if words.is_empty() {
            tracing::error!("command is empty");
            return Err(AppError::CommandIsNull);
        }

        let Some(address) = self.config.bus.listen.first().cloned() else {
            tracing::error!("there is no available listen address to deliver the command");
            return Err(AppError::NoAvailableAddress);
        };
        let addr = crate::address::Address::parse(&address)?;

        let connector = match self.default_connector.clone() {
            Some(connector) => connector,
            None => return Err(AppError::ChannelNotSupported),
        };

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        connector
            .borrow_mut()
            .start_command_request(&addr, &words, reply_tx);

        let deadline = self.config.timer.stop_timeout;
        let lines = match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(AppError::ConnectPeerFailed),
            Err(_) => return Err(AppError::Timeout),
        };
        for line in lines {
            println!("{line}");
        }
        Ok(())
    }

    // ========================= Pid file ========================= //

    pub(crate) fn write_pidfile(&self) -> bool {
        match &self.pid_file {
            Some(path) => pidfile::write_pidfile(path),
            None => true,
        }
    }

    fn cleanup_pidfile(&self) -> bool {
        if !self.config.remove_pidfile_after_exit || self.upgrade_mode {
            return true;
        }
        match &self.pid_file {
            Some(path) => pidfile::cleanup_pidfile(path),
            None => true,
        }
    }

    /// Deliver a custom command locally, as if it arrived from a peer.
    /// Used by embedders and tests.
    pub fn execute_custom_command(&mut self, words: &[String]) -> Vec<String> {
        let from = MessageSender::by_id(self.get_id());
        self.run_custom_command(&from, words)
    }
}
