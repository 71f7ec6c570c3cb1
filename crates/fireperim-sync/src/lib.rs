//! Poll loop orchestration: fetch → reduce → render → write → publish, forever.

use std::ffi::OsStr;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use fireperim_adapters::{FeatureFetcher, FeatureSource, FetchContext, PerimeterQuery, RetrySchedule};
use fireperim_core::{RawFeature, ReducedFeatureSet};
use fireperim_kml::KmlRenderer;
use fireperim_storage::{ArtifactStore, HttpClient, HttpClientConfig, StoredArtifact, DEFAULT_USER_AGENT};
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fireperim-sync";

pub const DEFAULT_OUTPUT_FILE: &str = "Cal_Fire_Intel_Boundary.kml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub normal: Duration,
    pub placeholder: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            normal: Duration::from_secs(600),
            placeholder: Duration::from_secs(1800),
        }
    }
}

/// Which branch a cycle took; decides the wait before the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Normal,
    Placeholder,
}

impl CycleKind {
    pub fn next_delay(self, intervals: &PollIntervals) -> Duration {
        match self {
            CycleKind::Normal => intervals.normal,
            CycleKind::Placeholder => intervals.placeholder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub endpoint: String,
    pub sources: Vec<String>,
    pub lookback_days: u32,
    pub output_dir: PathBuf,
    pub output_file_name: String,
    pub repo_dir: PathBuf,
    pub extra_publish_paths: Vec<PathBuf>,
    pub intervals: PollIntervals,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Extra attempts per fetch on transient failures.
    pub fetch_retries: u32,
    pub publish_enabled: bool,
    pub push_enabled: bool,
}

fn env_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let query = PerimeterQuery::default();
        let output_dir = lookup("FIREPERIM_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let defaults = PollIntervals::default();
        Self {
            endpoint: lookup("FIREPERIM_ENDPOINT").unwrap_or(query.endpoint),
            sources: lookup("FIREPERIM_SOURCES")
                .map(|v| split_list(&v))
                .unwrap_or(query.sources),
            lookback_days: lookup("FIREPERIM_LOOKBACK_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(query.lookback_days),
            repo_dir: lookup("FIREPERIM_REPO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| output_dir.clone()),
            output_dir,
            output_file_name: lookup("FIREPERIM_OUTPUT_FILE")
                .unwrap_or_else(|| DEFAULT_OUTPUT_FILE.to_string()),
            extra_publish_paths: lookup("FIREPERIM_EXTRA_PATHS")
                .map(|v| split_list(&v).into_iter().map(PathBuf::from).collect())
                .unwrap_or_default(),
            intervals: PollIntervals {
                normal: lookup("FIREPERIM_NORMAL_INTERVAL_SECS")
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.normal),
                placeholder: lookup("FIREPERIM_PLACEHOLDER_INTERVAL_SECS")
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.placeholder),
            },
            user_agent: lookup("FIREPERIM_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: lookup("FIREPERIM_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            fetch_retries: lookup("FIREPERIM_FETCH_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(RetrySchedule::default().retries),
            publish_enabled: lookup("FIREPERIM_PUBLISH")
                .map(|v| env_flag(&v))
                .unwrap_or(true),
            push_enabled: lookup("FIREPERIM_PUSH")
                .map(|v| env_flag(&v))
                .unwrap_or(true),
        }
    }

    /// Apply the keys present in a YAML config file on top of `self`.
    pub fn with_file(mut self, file: ConfigFile) -> Self {
        if let Some(v) = file.endpoint {
            self.endpoint = v;
        }
        if let Some(v) = file.sources {
            self.sources = v;
        }
        if let Some(v) = file.lookback_days {
            self.lookback_days = v;
        }
        if let Some(v) = file.output_dir {
            self.output_dir = v;
        }
        if let Some(v) = file.output_file_name {
            self.output_file_name = v;
        }
        if let Some(v) = file.repo_dir {
            self.repo_dir = v;
        }
        if let Some(v) = file.extra_publish_paths {
            self.extra_publish_paths = v;
        }
        if let Some(v) = file.normal_interval_secs {
            self.intervals.normal = Duration::from_secs(v);
        }
        if let Some(v) = file.placeholder_interval_secs {
            self.intervals.placeholder = Duration::from_secs(v);
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = file.fetch_retries {
            self.fetch_retries = v;
        }
        if let Some(v) = file.publish {
            self.publish_enabled = v;
        }
        if let Some(v) = file.push {
            self.push_enabled = v;
        }
        self
    }

    pub fn query(&self) -> PerimeterQuery {
        PerimeterQuery {
            endpoint: self.endpoint.clone(),
            sources: self.sources.clone(),
            lookback_days: self.lookback_days,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub endpoint: Option<String>,
    pub sources: Option<Vec<String>>,
    pub lookback_days: Option<u32>,
    pub output_dir: Option<PathBuf>,
    pub output_file_name: Option<String>,
    pub repo_dir: Option<PathBuf>,
    pub extra_publish_paths: Option<Vec<PathBuf>>,
    pub normal_interval_secs: Option<u64>,
    pub placeholder_interval_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub fetch_retries: Option<u32>,
    pub publish: Option<bool>,
    pub push: Option<bool>,
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Load configuration from the environment, overlaid by `config_path` if given.
pub fn load_config(config_path: Option<&Path>) -> Result<SyncConfig> {
    let config = SyncConfig::from_env();
    match config_path {
        Some(path) => Ok(config.with_file(ConfigFile::load(path)?)),
        None => Ok(config),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReductionStats {
    pub input: usize,
    pub skipped: usize,
    pub kept: usize,
}

/// Keeps the highest-`OBJECTID` record per mission.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureReducer;

impl FeatureReducer {
    pub fn new() -> Self {
        Self
    }

    /// Features without a mission or integer `OBJECTID` are dropped. A later
    /// record replaces the kept one only with a strictly greater `OBJECTID`.
    pub fn apply(
        &self,
        features: impl IntoIterator<Item = RawFeature>,
    ) -> (ReducedFeatureSet, ReductionStats) {
        let mut reduced = ReducedFeatureSet::new();
        let mut stats = ReductionStats::default();

        for feature in features {
            stats.input += 1;
            let (Some(mission), Some(object_id)) = (feature.mission(), feature.object_id()) else {
                stats.skipped += 1;
                continue;
            };
            let newer = match reduced.get(&mission).and_then(RawFeature::object_id) {
                Some(kept) => object_id > kept,
                None => true,
            };
            if newer {
                reduced.insert(mission, feature);
            }
        }

        stats.kept = reduced.len();
        (reduced, stats)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { commit_message: String, pushed: bool },
    /// Nothing was staged, so no commit was made.
    Unchanged,
    Disabled,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to run `git {args}`: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`git {args}` exited with {status}: {stderr}")]
    Command {
        args: String,
        status: String,
        stderr: String,
    },
    #[error("resolving artifact path {path}: {source}")]
    ArtifactPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait PublishSink: Send + Sync {
    async fn publish(&self, artifact: &Path, commit_label: &str) -> Result<PublishOutcome, PublishError>;
}

#[derive(Debug, Default)]
pub struct NoopPublishSink;

#[async_trait]
impl PublishSink for NoopPublishSink {
    async fn publish(&self, artifact: &Path, _commit_label: &str) -> Result<PublishOutcome, PublishError> {
        debug!(path = %artifact.display(), "publishing disabled");
        Ok(PublishOutcome::Disabled)
    }
}

pub fn commit_message(commit_label: &str, at: NaiveDateTime) -> String {
    format!("Add {commit_label} - {}", at.format("%Y-%m-%d %H:%M:%S"))
}

/// Stages, commits and pushes through the `git` CLI, always run with an
/// explicit working directory.
#[derive(Debug, Clone)]
pub struct GitPublishSink {
    repo_dir: PathBuf,
    extra_paths: Vec<PathBuf>,
    push: bool,
    program: PathBuf,
}

impl GitPublishSink {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            extra_paths: Vec::new(),
            push: true,
            program: PathBuf::from("git"),
        }
    }

    /// Paths staged alongside the artifact, relative to the repository.
    pub fn with_extra_paths(mut self, extra_paths: Vec<PathBuf>) -> Self {
        self.extra_paths = extra_paths;
        self
    }

    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn git<I, S>(&self, args: I) -> Result<(String, Output), PublishError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let display = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let output = Command::new(&self.program)
            .args(&args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|source| PublishError::Spawn {
                args: display.clone(),
                source,
            })?;
        Ok((display, output))
    }

    async fn git_checked<I, S>(&self, args: I) -> Result<Output, PublishError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let (display, output) = self.git(args).await?;
        if !output.status.success() {
            return Err(PublishError::Command {
                args: display,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl PublishSink for GitPublishSink {
    async fn publish(&self, artifact: &Path, commit_label: &str) -> Result<PublishOutcome, PublishError> {
        let status = self.git_checked(["status", "--short"]).await?;
        debug!(status = %String::from_utf8_lossy(&status.stdout).trim_end(), "git status");

        let artifact = std::path::absolute(artifact).map_err(|source| PublishError::ArtifactPath {
            path: artifact.to_path_buf(),
            source,
        })?;
        self.git_checked([OsStr::new("add"), artifact.as_os_str()]).await?;
        for extra in &self.extra_paths {
            self.git_checked([OsStr::new("add"), extra.as_os_str()]).await?;
        }

        let (_, staged) = self.git(["diff", "--cached", "--quiet"]).await?;
        if staged.status.success() {
            info!(label = commit_label, "no staged changes; skipping commit");
            return Ok(PublishOutcome::Unchanged);
        }

        let message = commit_message(commit_label, Local::now().naive_local());
        self.git_checked(["commit", "-m", message.as_str()]).await?;
        if self.push {
            self.git_checked(["push"]).await?;
        }
        Ok(PublishOutcome::Published {
            commit_message: message,
            pushed: self.push,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    NotAttempted,
    Done(PublishOutcome),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub kind: CycleKind,
    pub fetched: usize,
    /// Set when the fetch failed; the cycle still takes the placeholder branch.
    pub fetch_error: Option<String>,
    pub reduction: ReductionStats,
    pub shapes: usize,
    pub artifact: Option<StoredArtifact>,
    /// Render or write failure that stopped the cycle before publishing.
    pub failure: Option<String>,
    pub publish: PublishStatus,
    pub next_delay: Duration,
}

pub struct PollLoop {
    source: Box<dyn FeatureSource>,
    sink: Box<dyn PublishSink>,
    store: ArtifactStore,
    renderer: KmlRenderer,
    reducer: FeatureReducer,
    intervals: PollIntervals,
    output_file_name: String,
}

impl PollLoop {
    pub fn new(
        source: Box<dyn FeatureSource>,
        sink: Box<dyn PublishSink>,
        store: ArtifactStore,
        output_file_name: impl Into<String>,
    ) -> Self {
        let output_file_name = output_file_name.into();
        Self {
            source,
            sink,
            store,
            renderer: KmlRenderer::new(output_file_name.clone()),
            reducer: FeatureReducer::new(),
            intervals: PollIntervals::default(),
            output_file_name,
        }
    }

    pub fn with_intervals(mut self, intervals: PollIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    /// Wire the live feature service, the output store and (unless disabled)
    /// the git sink from configuration.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = HttpClient::new(&HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
        })?;
        let source = FeatureFetcher::new(config.query(), http)
            .with_retry(RetrySchedule::default().with_retries(config.fetch_retries));
        let sink: Box<dyn PublishSink> = if config.publish_enabled {
            Box::new(
                GitPublishSink::new(&config.repo_dir)
                    .with_extra_paths(config.extra_publish_paths.clone())
                    .with_push(config.push_enabled),
            )
        } else {
            Box::new(NoopPublishSink)
        };
        Ok(Self::new(
            Box::new(source),
            sink,
            ArtifactStore::new(&config.output_dir),
            config.output_file_name.clone(),
        )
        .with_intervals(config.intervals))
    }

    /// One full cycle. Never fails: every component error is logged and
    /// recorded on the report.
    pub async fn run_cycle(&self) -> CycleReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %run_id);
        self.cycle(run_id).instrument(span).await
    }

    async fn cycle(&self, run_id: Uuid) -> CycleReport {
        let started_at = Utc::now();
        let mut report = CycleReport {
            run_id,
            started_at,
            finished_at: started_at,
            kind: CycleKind::Placeholder,
            fetched: 0,
            fetch_error: None,
            reduction: ReductionStats::default(),
            shapes: 0,
            artifact: None,
            failure: None,
            publish: PublishStatus::NotAttempted,
            next_delay: self.intervals.placeholder,
        };

        let ctx = FetchContext {
            run_id,
            today: Local::now().date_naive(),
        };
        let outcome = self.source.fetch(&ctx).await;
        let features = outcome.features;
        report.fetch_error = outcome.failure;
        report.fetched = features.len();
        info!(
            fetched = report.fetched,
            fetch_failed = report.fetch_error.is_some(),
            "fetched features"
        );

        let (reduced, stats) = self.reducer.apply(features);
        report.reduction = stats;
        if report.fetched > 0 {
            info!(kept = stats.kept, skipped = stats.skipped, "filtered to most recent features");
        }

        report.kind = if reduced.is_empty() {
            CycleKind::Placeholder
        } else {
            CycleKind::Normal
        };
        report.next_delay = report.kind.next_delay(&self.intervals);

        let rendered = match report.kind {
            CycleKind::Placeholder => {
                info!("no features; writing placeholder document");
                self.renderer.render_placeholder().map(|text| (text, 1))
            }
            CycleKind::Normal => self.renderer.build(&reduced).and_then(|doc| {
                let shapes = doc.shapes.len();
                doc.render().map(|text| (text, shapes))
            }),
        };
        let text = match rendered {
            Ok((text, shapes)) => {
                report.shapes = shapes;
                text
            }
            Err(err) => {
                error!(error = %err, "rendering document failed");
                report.failure = Some(err.to_string());
                report.finished_at = Utc::now();
                return report;
            }
        };

        let artifact = match self.store.overwrite(&self.output_file_name, text.as_bytes()).await {
            Ok(artifact) => artifact,
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "writing document failed");
                report.failure = Some(message);
                report.finished_at = Utc::now();
                return report;
            }
        };
        info!(
            path = %artifact.absolute_path.display(),
            bytes = artifact.byte_size,
            sha256 = %artifact.content_hash,
            unchanged = artifact.unchanged,
            shapes = report.shapes,
            "document written"
        );

        report.publish = match self
            .sink
            .publish(&artifact.absolute_path, &self.output_file_name)
            .await
        {
            Ok(outcome) => {
                info!(?outcome, "publish finished");
                PublishStatus::Done(outcome)
            }
            Err(err) => {
                error!(error = %err, "error during publish");
                PublishStatus::Failed(err.to_string())
            }
        };
        report.artifact = Some(artifact);
        report.finished_at = Utc::now();
        report
    }

    /// Run cycles until `shutdown` resolves or `max_cycles` have run. Each
    /// cycle runs as its own task so a panic is contained to that cycle.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F, max_cycles: Option<usize>) -> usize
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut cycles = 0usize;
        loop {
            let this = Arc::clone(&self);
            let delay = match tokio::spawn(async move { this.run_cycle().await }).await {
                Ok(report) => {
                    info!(
                        run_id = %report.run_id,
                        kind = ?report.kind,
                        delay_secs = report.next_delay.as_secs(),
                        "cycle complete"
                    );
                    report.next_delay
                }
                Err(err) => {
                    error!(error = %err, "poll cycle aborted");
                    self.intervals.placeholder
                }
            };
            cycles += 1;
            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => {
                    info!(cycles, "shutdown requested; stopping poll loop");
                    break;
                }
            }
        }
        cycles
    }
}
