// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron triggers for worker `scheduled` handlers.
//!
//! A worker may declare `schedulers: [{name, cron}]`. While it is installed on
//! this node, one task per entry sleeps until the next occurrence and posts a
//! [`ScheduledEvent`] to the worker's control socket, which hands it to the
//! worker's `scheduled` handler.
//!
//! Expressions take five or six fields (seconds optional) and are evaluated in
//! UTC. An expression that does not parse is logged and skipped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config_gen::declaration::SchedulerEntry;

/// Host the control socket of every worker binds.
pub const DEFAULT_CONTROL_HOST: &str = "localhost";

/// Path of the control service that receives scheduled events.
pub const SCHEDULED_PATH: &str = "/__control/scheduled";

const FIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Body posted to the control socket when a trigger fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    /// Always `scheduled`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Expression that fired.
    pub cron: String,
    /// Occurrence time, milliseconds since the epoch.
    pub scheduled_time: i64,
}

impl ScheduledEvent {
    fn new(cron: &str, at: DateTime<Utc>) -> Self {
        Self {
            kind: "scheduled".to_string(),
            cron: cron.to_string(),
            scheduled_time: at.timestamp_millis(),
        }
    }
}

struct WorkerJobs {
    cancel: CancellationToken,
    names: Vec<String>,
}

/// Runs the cron triggers of locally installed workers.
pub struct CronScheduler {
    http: reqwest::Client,
    control_host: String,
    jobs: DashMap<String, WorkerJobs>,
}

impl CronScheduler {
    /// Scheduler posting to control sockets on `control_host`.
    pub fn new(control_host: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            control_host: control_host.into(),
            jobs: DashMap::new(),
        }
    }

    /// Replace the triggers of `uid` with `entries`. Returns how many were registered.
    pub fn register(&self, uid: &str, control_port: u16, entries: &[SchedulerEntry]) -> usize {
        self.remove(uid);

        let cancel = CancellationToken::new();
        let mut names = Vec::new();
        for entry in entries {
            if entry.cron.trim().is_empty() {
                continue;
            }
            let cron = match Cron::new(&entry.cron).with_seconds_optional().parse() {
                Ok(cron) => cron,
                Err(e) => {
                    warn!(worker_uid = %uid, scheduler = %entry.name, cron = %entry.cron, error = %e, "Invalid cron expression, skipping");
                    continue;
                }
            };

            let job = CronJob {
                uid: uid.to_string(),
                name: entry.name.clone(),
                expression: entry.cron.clone(),
                cron,
                url: format!("http://{}:{}{}", self.control_host, control_port, SCHEDULED_PATH),
                http: self.http.clone(),
            };
            tokio::spawn(job.run(cancel.child_token()));
            names.push(entry.name.clone());
        }

        if names.is_empty() {
            return 0;
        }
        let count = names.len();
        info!(worker_uid = %uid, count, "Scheduler jobs registered");
        self.jobs.insert(uid.to_string(), WorkerJobs { cancel, names });
        count
    }

    /// Cancel every trigger of `uid`. Returns how many were removed.
    pub fn remove(&self, uid: &str) -> usize {
        match self.jobs.remove(uid) {
            Some((_, jobs)) => {
                jobs.cancel.cancel();
                debug!(worker_uid = %uid, count = jobs.names.len(), "Scheduler jobs removed");
                jobs.names.len()
            }
            None => 0,
        }
    }

    /// Cancel every trigger of every worker.
    pub fn remove_all(&self) {
        let uids: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        for uid in uids {
            self.remove(&uid);
        }
    }

    /// Names of the active triggers of `uid`.
    pub fn jobs(&self, uid: &str) -> Vec<String> {
        self.jobs
            .get(uid)
            .map(|jobs| jobs.names.clone())
            .unwrap_or_default()
    }
}

struct CronJob {
    uid: String,
    name: String,
    expression: String,
    cron: Cron,
    url: String,
    http: reqwest::Client,
}

impl CronJob {
    async fn run(self, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let next = match self.cron.find_next_occurrence(&now, false) {
                Ok(next) => next,
                Err(e) => {
                    warn!(worker_uid = %self.uid, scheduler = %self.name, error = %e, "No next occurrence, job ends");
                    return;
                }
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return,

                _ = tokio::time::sleep(wait) => {}
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return,

                _ = self.fire(next) => {}
            }
        }
    }

    async fn fire(&self, at: DateTime<Utc>) {
        let event = ScheduledEvent::new(&self.expression, at);
        let result = self
            .http
            .post(&self.url)
            .timeout(FIRE_TIMEOUT)
            .json(&event)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match result {
            Ok(_) => debug!(worker_uid = %self.uid, scheduler = %self.name, "Scheduled event delivered"),
            Err(e) => warn!(worker_uid = %self.uid, scheduler = %self.name, error = %e, "Scheduled event delivery failed"),
        }
    }
}
