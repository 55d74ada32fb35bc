// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Gateway match filtering
//!
//! A remote node advertises an ordered list of ingress gateways, each with
//! optional constraints. Before dialing one, the local node checks whether
//! it is allowed to: constraints are evaluated left to right and
//! short-circuit on the first failure. The matcher is pure and reads only
//! local node configuration.

use crate::config::GatewayConfig;
use crate::message::Metadata;

/// Evaluates gateway constraints against the local node's identity.
#[derive(Debug, Clone, Default)]
pub struct GatewayMatcher {
    hostname: String,
    metadata: Metadata,
}

impl GatewayMatcher {
    /// Build a matcher for the given local hostname and metadata.
    pub fn new(hostname: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            hostname: hostname.into(),
            metadata,
        }
    }

    /// Whether this local node may use the advertised gateway.
    ///
    /// 1. The gateway address must be non-empty.
    /// 2. `match_hosts`: a list with at least one non-empty entry must
    ///    contain the local hostname. An all-empty list counts as absent.
    /// 3. `match_namespaces`: the same rule against the local
    ///    `metadata.namespace_name`.
    /// 4. `match_labels`: every pair with non-empty key and value must be
    ///    present in the local labels with the same value.
    pub fn matches(&self, gateway: &GatewayConfig) -> bool {
        if gateway.address.is_empty() {
            return false;
        }

        if !self.match_hosts(gateway) {
            return false;
        }

        if !self.match_namespaces(gateway) {
            return false;
        }

        self.match_labels(gateway)
    }

    fn match_hosts(&self, gateway: &GatewayConfig) -> bool {
        let mut has_constraint = false;
        for host in &gateway.match_hosts {
            if host.is_empty() {
                continue;
            }
            has_constraint = true;
            if *host == self.hostname {
                return true;
            }
        }
        !has_constraint
    }

    fn match_namespaces(&self, gateway: &GatewayConfig) -> bool {
        let mut has_constraint = false;
        for namespace in &gateway.match_namespaces {
            if namespace.is_empty() {
                continue;
            }
            has_constraint = true;
            if *namespace == self.metadata.namespace_name {
                return true;
            }
        }
        !has_constraint
    }

    fn match_labels(&self, gateway: &GatewayConfig) -> bool {
        for (key, expected) in &gateway.match_labels {
            if key.is_empty() || expected.is_empty() {
                continue;
            }
            match self.metadata.labels.get(key) {
                Some(actual) if actual == expected => {}
                _ => return false,
            }
        }
        true
    }
}
