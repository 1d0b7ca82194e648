// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use solva_bus::Bus;
use solva_config::Config;
use solva_store::Store;

use crate::mode::ModeAssigner;

/// Shared per-process state: one multiplexed bus client, one bounded
/// store pool, read-only config.  No other global mutable state exists.
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn Bus>,
    pub store: Store,
    pub config: Arc<Config>,
    pub modes: ModeAssigner,
}

impl AppState {
    pub fn new(bus: Arc<dyn Bus>, store: Store, config: Arc<Config>) -> Self {
        let modes = ModeAssigner::new(store.clone());
        Self {
            bus,
            store,
            config,
            modes,
        }
    }
}
