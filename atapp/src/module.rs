// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The module contract for domain extensions
//!
//! Modules are the unit of composition for applications built on the
//! framework: each one is registered before `init` and driven through a
//! fixed set of hook points by the app lifecycle. Hooks are invoked in
//! registration order (cleanup in reverse order); a module that fails
//! `init` causes every already-initialized module to be cleaned up and the
//! error to surface from `init`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::app::App;
use crate::config::AppConfig;
use crate::errors::AppError;

/// Shared reference to a registered module.
pub type ModuleRef = Rc<RefCell<dyn AppModule>>;

/// Hook points surfaced to domain extensions.
///
/// All hooks have reasonable defaults so implementors only write what they
/// need; `name` is required since it anchors every lifecycle log line.
pub trait AppModule {
    /// Module name used in lifecycle logging.
    fn name(&self) -> &str;

    /// Called once before anything else, with the loaded configuration.
    fn setup(&mut self, _config: &AppConfig) -> Result<(), AppError> {
        Ok(())
    }

    /// Called on every configuration reload (including the one during
    /// init).
    fn reload(&mut self, _config: &AppConfig) -> Result<(), AppError> {
        Ok(())
    }

    /// Initialize the module. An `Err` aborts app startup and rolls back
    /// previously initialized modules in reverse order.
    fn init(&mut self, _app: &mut App) -> Result<(), AppError> {
        Ok(())
    }

    /// Called after every module initialized successfully.
    fn ready(&mut self, _app: &mut App) {}

    /// One cooperative tick. A positive return marks the module busy and
    /// drives an immediate re-tick while the tick budget lasts.
    fn tick(&mut self, _app: &mut App) -> i32 {
        0
    }

    /// Cooperative stop. Return `0` when fully stopped, a negative value
    /// to report failure (the module is disabled either way), or a
    /// positive value to keep receiving ticks while draining.
    fn stop(&mut self, _app: &mut App) -> i32 {
        0
    }

    /// The stop grace period elapsed; the module will be disabled
    /// immediately after this returns.
    fn timeout(&mut self) {}

    /// Final teardown, invoked in reverse registration order.
    fn cleanup(&mut self) {}
}

/// Bookkeeping the app keeps per registered module.
pub(crate) struct ModuleEntry {
    pub(crate) module: ModuleRef,
    /// Disabled modules are skipped by every hook
    pub(crate) enabled: bool,
    /// Set once `init` succeeded; only active modules tick
    pub(crate) active: bool,
}

impl ModuleEntry {
    pub(crate) fn new(module: ModuleRef) -> Self {
        Self {
            module,
            enabled: true,
            active: false,
        }
    }
}
