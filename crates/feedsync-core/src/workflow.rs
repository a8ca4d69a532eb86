//! The end-to-end sequence: discover → verify availability → trigger sync →
//! wait for sync → snapshot.
//!
//! Stages run in order and the first failure aborts the run. Retries only
//! happen inside a stage's poller; the sequencer never repeats a stage.
//! Everything user-visible goes through [`Progress`], so the CLI decides how
//! it is rendered.

use std::fmt;

use chrono::{NaiveDateTime, Utc};

use crate::config::{Config, RunOptions};
use crate::error::{FeedSyncError, Result};
use crate::evaluator::{classify, SyncSummary};
use crate::executor::{
    display_command, execute, run_captured, BackgroundProcess, Cancellation, ExecutionResult,
};
use crate::fetcher::{FeedsClient, FetchError};
use crate::poller::{PollOutcome, Poller};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discover,
    VerifyAvailability,
    TriggerSync,
    WaitForSync,
    Snapshot,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Discover,
        Stage::VerifyAvailability,
        Stage::TriggerSync,
        Stage::WaitForSync,
        Stage::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discover => "discover containers",
            Stage::VerifyAvailability => "verify engine availability",
            Stage::TriggerSync => "feed sync",
            Stage::WaitForSync => "feed sync completion",
            Stage::Snapshot => "database snapshot",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Receiver for everything the workflow wants a human to see.
pub trait Progress {
    /// A stage is starting.
    fn stage(&mut self, stage: Stage);
    /// A stage finished; `message` says what it established.
    fn stage_done(&mut self, stage: Stage, message: &str);
    /// One line of streamed output from a readiness command.
    fn line(&mut self, line: &str);
    /// A status document was fetched and classified.
    fn sync_status(&mut self, summary: &SyncSummary);
    /// A retryable problem; polling continues.
    fn diagnostic(&mut self, message: &str);
    /// An orchestration command finished.
    fn command(&mut self, result: &ExecutionResult);
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Containers {
    pub db_id: String,
    pub engine_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Image label reported for the prepopulated database.
    pub image: String,
    /// Dump file copied into the working directory.
    pub artifact: String,
}

fn now_utc() -> NaiveDateTime {
    Utc::now().naive_utc()
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct Workflow<P: Progress> {
    config: Config,
    options: RunOptions,
    client: FeedsClient,
    progress: P,
    cancel: Cancellation,
}

impl<P: Progress> Workflow<P> {
    pub fn new(config: Config, options: RunOptions, progress: P) -> Result<Self> {
        config.validate()?;
        let client = FeedsClient::from_config(&config.engine)?;
        Ok(Self {
            config,
            options,
            client,
            progress,
            cancel: Cancellation::new(),
        })
    }

    /// Spawn every child through `cancel`, so cancelling it from another
    /// thread kills whatever this workflow is running.
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn progress(&self) -> &P {
        &self.progress
    }

    pub fn into_progress(self) -> P {
        self.progress
    }

    /// Run every stage in order, stopping at the first failure.
    pub fn run(&mut self) -> Result<Snapshot> {
        let containers = self.in_stage(Stage::Discover, |w| w.discover())?;
        self.finish(
            Stage::Discover,
            &format!(
                "got container IDs: engine={} db={}",
                containers.engine_id, containers.db_id
            ),
        );

        self.in_stage(Stage::VerifyAvailability, |w| w.verify_available())?;
        let engine = self.config.services.engine.clone();
        self.finish(
            Stage::VerifyAvailability,
            &format!("verified that {engine} is up and ready"),
        );

        self.in_stage(Stage::TriggerSync, |w| w.trigger_sync())?;
        self.finish(Stage::TriggerSync, "feed sync request completed");

        self.in_stage(Stage::WaitForSync, |w| w.wait_for_sync())?;
        self.finish(Stage::WaitForSync, "verified feed sync has completed");

        let snapshot = self.in_stage(Stage::Snapshot, |w| w.snapshot())?;
        self.finish(
            Stage::Snapshot,
            &format!("database dump copied to {}", snapshot.artifact),
        );
        Ok(snapshot)
    }

    fn finish(&mut self, stage: Stage, message: &str) {
        tracing::info!(stage = %stage, "stage finished");
        self.progress.stage_done(stage, message);
    }

    fn in_stage<T>(&mut self, stage: Stage, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        tracing::info!(stage = %stage, "stage starting");
        self.progress.stage(stage);
        let result = f(self).map_err(|source| FeedSyncError::Stage {
            stage,
            source: Box::new(source),
        });
        if let Err(e) = &result {
            tracing::warn!(stage = %stage, error = %e, "stage failed");
        }
        result
    }

    // -- discover -----------------------------------------------------------

    /// Look up the container ids of the database and engine services. Both
    /// must be running.
    pub fn discover(&mut self) -> Result<Containers> {
        let db_id = self.container_id(&self.config.services.db)?;
        let engine_id = self.container_id(&self.config.services.engine)?;

        if db_id.is_empty() || engine_id.is_empty() {
            return Err(FeedSyncError::DiscoveryFailed(format!(
                "{} (discovered id={engine_id:?}) and {} (discovered id={db_id:?}) must be running",
                self.config.services.engine, self.config.services.db
            )));
        }

        tracing::info!(engine = %engine_id, db = %db_id, "discovered containers");
        Ok(Containers { db_id, engine_id })
    }

    fn container_id(&self, service: &str) -> Result<String> {
        let argv = self.compose(&["ps", "-q", service]);
        let result = run_captured(&argv, &self.cancel).map_err(|e| {
            FeedSyncError::DiscoveryFailed(format!(
                "command failed getting container ID: {}: {e}",
                display_command(&argv)
            ))
        })?;
        Ok(result.output().trim().to_string())
    }

    // -- verify availability ------------------------------------------------

    /// Wait until the engine answers the feeds endpoint: first through the
    /// engine CLI's own readiness wait, then by polling the endpoint until it
    /// returns 200.
    pub fn verify_available(&mut self) -> Result<()> {
        if let Some(argv) = self.readiness_command("") {
            self.stream(&argv)?;
        }

        let poller = Poller::from_options(&self.options);
        let Self {
            client, progress, ..
        } = self;

        // Any 200 means the engine is serving; the body is checked later.
        let state = poller.run(|| match client.fetch_status() {
            Ok(_) | Err(FetchError::MalformedBody(_)) => Ok(PollOutcome::Success),
            Err(e) => {
                progress.diagnostic(&format!("engine not ready yet, trying again: {e}"));
                Ok(PollOutcome::Continue)
            }
        })?;

        state.into_result(Stage::VerifyAvailability.as_str(), poller.deadline())
    }

    // -- trigger sync -------------------------------------------------------

    /// Start the sync trigger in the background and report status until it
    /// exits. The trigger's exit code decides the outcome; classification
    /// is reported but does not end the stage.
    pub fn trigger_sync(&mut self) -> Result<()> {
        let argv = self.trigger_command();
        let mut trigger = BackgroundProcess::spawn(&argv, &self.cancel)?;
        tracing::info!(command = %trigger.command(), "sync triggered");

        let poller = Poller::from_options(&self.options);
        let Self {
            client, progress, ..
        } = self;

        let state = poller.run(|| {
            report_status(client, progress)?;
            Ok(match trigger.try_exit_code()? {
                None => PollOutcome::Continue,
                Some(0) => PollOutcome::Success,
                Some(code) => PollOutcome::Failure(format!(
                    "feed sync initialization failed: `{}` exited with code {code}",
                    trigger.command()
                )),
            })
        })?;

        state.into_result(Stage::TriggerSync.as_str(), poller.deadline())
    }

    // -- wait for sync ------------------------------------------------------

    /// Wait for the configured feed through the engine CLI, then poll until
    /// every reported group is fresh.
    pub fn wait_for_sync(&mut self) -> Result<()> {
        let feed = self.config.readiness.feed.clone();
        if let Some(argv) = self.readiness_command(&feed) {
            self.stream(&argv)?;
        }

        let poller = Poller::from_options(&self.options);
        let Self {
            client, progress, ..
        } = self;

        let state = poller.run(|| {
            Ok(match report_status(client, progress)? {
                Some(summary) if summary.is_complete() => PollOutcome::Success,
                _ => PollOutcome::Continue,
            })
        })?;

        state.into_result(Stage::WaitForSync.as_str(), poller.deadline())
    }

    // -- snapshot -----------------------------------------------------------

    /// Stop the engine, dump the database, copy the dump out and tear the
    /// deployment down.
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        for argv in self.snapshot_commands() {
            tracing::info!(command = %display_command(&argv), "running");
            let result = run_captured(&argv, &self.cancel)?;
            self.progress.command(&result);
        }
        Ok(Snapshot {
            image: self.config.snapshot.image.clone(),
            artifact: self.config.snapshot.artifact_name().to_string(),
        })
    }

    // -- command templates --------------------------------------------------

    fn compose(&self, args: &[&str]) -> Vec<String> {
        let mut argv = self.config.services.compose.clone();
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    fn docker(&self, args: &[&str]) -> Vec<String> {
        let mut argv = self.config.services.docker.clone();
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    /// `system wait` for `feed` (empty: engine up, no feed requirement).
    /// `None` when no readiness command is configured.
    pub fn readiness_command(&self, feed: &str) -> Option<Vec<String>> {
        if self.config.readiness.command.is_empty() {
            return None;
        }
        let engine = &self.config.engine;
        let mut argv = self.config.readiness.command.clone();
        argv.extend([
            "--u".to_string(),
            engine.user.clone(),
            "--p".to_string(),
            engine.password.clone(),
            "--url".to_string(),
            engine.url.clone(),
            "system".to_string(),
            "wait".to_string(),
            "--timeout".to_string(),
            self.options.timeout.as_secs().to_string(),
            "--interval".to_string(),
            format!("{:?}", self.options.interval.as_secs_f64()),
            "--feedsready".to_string(),
            feed.to_string(),
        ]);
        Some(argv)
    }

    pub fn trigger_command(&self) -> Vec<String> {
        if let Some(argv) = &self.config.trigger.command {
            return argv.clone();
        }
        let engine = &self.config.engine;
        vec![
            "curl".to_string(),
            "-u".to_string(),
            format!("{}:{}", engine.user, engine.password),
            "-X".to_string(),
            "POST".to_string(),
            self.client.sync_url(),
        ]
    }

    pub fn snapshot_commands(&self) -> Vec<Vec<String>> {
        let services = &self.config.services;
        let snapshot = &self.config.snapshot;

        let mut dump = vec![
            "pg_dump".to_string(),
            "-U".to_string(),
            snapshot.db_user.clone(),
            "-Z".to_string(),
            "9".to_string(),
        ];
        dump.extend(snapshot.exclude_options(self.options.slim));
        dump.push(">".to_string());
        dump.push(snapshot.dump_path.clone());

        let dump = dump.join(" ");
        let source = format!("{}:{}", services.db_container, snapshot.dump_path);

        vec![
            self.compose(&["stop", services.engine.as_str()]),
            self.compose(&["exec", "-T", services.db.as_str(), "/bin/bash", "-c", dump.as_str()]),
            self.docker(&["cp", source.as_str(), "."]),
            self.compose(&["down", "--volumes"]),
        ]
    }

    fn stream(&mut self, argv: &[String]) -> Result<()> {
        for line in execute(argv, &self.cancel)? {
            self.progress.line(&line?);
        }
        Ok(())
    }
}

/// Fetch and classify once. Bad HTTP statuses are reported and yield `None`;
/// every other failure is returned.
fn report_status<P: Progress>(client: &FeedsClient, progress: &mut P) -> Result<Option<SyncSummary>> {
    match client.fetch_status() {
        Ok(document) => {
            let summary = classify(&document, now_utc())?;
            tracing::debug!(
                synced = summary.synced_count,
                total = summary.total_count,
                "feed status"
            );
            progress.sync_status(&summary);
            Ok(Some(summary))
        }
        Err(e) if e.is_retryable() => {
            tracing::warn!(error = %e, "bad response from feeds endpoint");
            progress.diagnostic(&format!("{e}, trying again"));
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
