// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The cooperative tick pass
//!
//! One tick refreshes the cached clock, runs every enabled+active module,
//! advances the connectors, drains pending core events, and finally
//! drains the waker queue - retrying or expiring buffered messages and
//! collecting endpoints that lost their last connection. A pass that
//! reports activity re-runs immediately until the tick interval budget
//! elapses.

use std::time::{Instant, SystemTime};

use super::App;
use crate::endpoint::RoutedResponse;

impl App {
    /// Run one tick pass (possibly looping while work remains). Returns
    /// `0`; activity is accumulated into the loop's event counter.
    pub fn tick(&mut self) -> i32 {
        let conf_tick_interval = self.config.timer.effective_tick_interval();
        let start = Instant::now();

        loop {
            let now = Instant::now();
            self.last_tick = now;
            let mut active: i64 = 0;

            // step 1. proc available modules
            for index in 0..self.modules.len() {
                if !self.modules[index].enabled || !self.modules[index].active {
                    continue;
                }
                let module = self.modules[index].module.clone();
                let result = module.borrow_mut().tick(self);
                if result < 0 {
                    tracing::error!(
                        "module {} run tick and return {result}",
                        module.borrow().name()
                    );
                } else {
                    active += result as i64;
                }
            }

            // step 2. advance the transports
            for connector in self.connectors.clone() {
                let result = connector.borrow_mut().tick(now);
                if result > 0 {
                    active += result as i64;
                }
            }

            // step 3. marshal connector events into the core
            active += self.process_core_events() as i64;

            // step 4. proc pending messages of endpoints
            active += self.drain_wakers(now);

            if active > 0 {
                self.last_proc_event_count += active as u64;
            }

            // only a busy pass that still fits the interval loops again
            if !(active > 0 && start.elapsed() < conf_tick_interval) {
                break;
            }
        }

        self.emit_minute_statistics();
        0
    }

    fn drain_wakers(&mut self, now: Instant) -> i64 {
        let loop_times = self.config.bus.loop_times;
        let mut active: i64 = 0;

        while let Some(weak) = self.waker.pop_due(now) {
            self.stats.endpoint_wake_count += 1;

            let Some(endpoint) = weak.upgrade() else {
                // endpoint went away; stale entries just drop
                continue;
            };

            let mut responses: Vec<RoutedResponse> = Vec::new();
            let processed = {
                let mut ops = self.endpoint_ops(&mut responses);
                endpoint
                    .borrow_mut()
                    .retry_pending_messages(&mut ops, loop_times)
            };
            self.dispatch_routed_responses(responses);
            if processed > 0 {
                active += processed as i64;
            }

            if !endpoint.borrow().has_connection_handle() {
                self.remove_endpoint(&endpoint);
            }
        }

        active
    }

    fn emit_minute_statistics(&mut self) {
        let now_min = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() / 60)
            .unwrap_or(0);
        if now_min == self.stats.last_checkpoint_min {
            return;
        }

        let last_min = self.stats.last_checkpoint_min;
        self.stats.last_checkpoint_min = now_min;
        if last_min + 1 == now_min {
            tracing::info!(
                "[STATISTICS]: {} endpoint wake count: {}, by_id index size: {}, by_name index size: {}, waker size: {}",
                self.get_app_name(),
                self.stats.endpoint_wake_count,
                self.endpoint_index_sizes().0,
                self.endpoint_index_sizes().1,
                self.waker.len()
            );
        }
        self.stats.endpoint_wake_count = 0;
    }
}
