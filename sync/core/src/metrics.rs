// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntGauge, Registry,
};

/// Metrics of one coordinator and the stores attached to its file.
pub struct Metrics {
    pub notifier_runs: IntCounter,
    pub notifier_deliveries: IntCounter,
    pub notifier_errors: IntCounter,
    pub registered_notifiers: IntGauge,
    pub commits_observed: IntCounter,
    pub changesets_integrated: IntCounter,
    pub changesets_uploaded: IntCounter,
    pub integration_failures: IntCounter,
    pub bootstrap_batches_staged: IntCounter,
    pub bootstrap_batches_popped: IntCounter,
    pub worker_tick_latency: Histogram,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Metrics> {
        Arc::new(Metrics {
            notifier_runs: register_int_counter_with_registry!(
                "sync_notifier_runs",
                "Number of notifier diff computations on the worker thread",
                registry
            )
            .unwrap(),
            notifier_deliveries: register_int_counter_with_registry!(
                "sync_notifier_deliveries",
                "Number of notifier deliveries on target threads",
                registry
            )
            .unwrap(),
            notifier_errors: register_int_counter_with_registry!(
                "sync_notifier_errors",
                "Number of notifiers that entered the error state",
                registry
            )
            .unwrap(),
            registered_notifiers: register_int_gauge_with_registry!(
                "sync_registered_notifiers",
                "Number of live notifiers registered with the coordinator",
                registry
            )
            .unwrap(),
            commits_observed: register_int_counter_with_registry!(
                "sync_commits_observed",
                "Number of commit signals observed by the worker",
                registry
            )
            .unwrap(),
            changesets_integrated: register_int_counter_with_registry!(
                "sync_changesets_integrated",
                "Number of remote changesets integrated into the history",
                registry
            )
            .unwrap(),
            changesets_uploaded: register_int_counter_with_registry!(
                "sync_changesets_uploaded",
                "Number of local changesets selected for upload",
                registry
            )
            .unwrap(),
            integration_failures: register_int_counter_with_registry!(
                "sync_integration_failures",
                "Number of failed remote changeset integrations",
                registry
            )
            .unwrap(),
            bootstrap_batches_staged: register_int_counter_with_registry!(
                "sync_bootstrap_batches_staged",
                "Number of bootstrap batches staged to the pending store",
                registry
            )
            .unwrap(),
            bootstrap_batches_popped: register_int_counter_with_registry!(
                "sync_bootstrap_batches_popped",
                "Number of bootstrap batches popped after integration",
                registry
            )
            .unwrap(),
            worker_tick_latency: register_histogram_with_registry!(
                "sync_worker_tick_latency",
                "Seconds spent per background notification tick",
                registry
            )
            .unwrap(),
        })
    }

    pub fn new_for_test() -> Arc<Metrics> {
        Metrics::new(&Registry::new())
    }
}
