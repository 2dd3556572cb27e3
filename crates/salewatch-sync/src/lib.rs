//! Run orchestration: county by county extraction, incremental tab writes, the
//! "All Data" aggregate, and run reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use salewatch_adapters::{fixture_extractor, live_extractor, RecordExtractor, DEFAULT_BASE_URL};
use salewatch_core::{snapshot_label_today, GroupSource, Record, ALL_DATA_TAB};
use salewatch_merge::{MergeConfig, MergeEngine, MissingIdPolicy, PlanKind, WritePlan};
use salewatch_storage::{
    BackoffPolicy, CellAnchor, HttpClientConfig, HttpFetcher, JsonFileTabStore, Presentation,
    TabularStore,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "salewatch-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct CountyRegistry {
    pub counties: Vec<CountyConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CountyConfig {
    pub county_id: String,
    pub county_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl CountyRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing county registry")?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Enabled counties in registry order.
    pub fn enabled_groups(&self) -> Vec<GroupSource> {
        self.counties
            .iter()
            .filter(|c| c.enabled)
            .map(|c| GroupSource::new(c.county_id.clone(), c.county_name.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_url: String,
    pub counties_path: PathBuf,
    pub store_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub polite_delay: Duration,
    pub max_retries: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub emit_empty_marker: bool,
    pub missing_id_policy: MissingIdPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            counties_path: PathBuf::from("counties.yaml"),
            store_dir: PathBuf::from("./store"),
            reports_dir: PathBuf::from("./reports"),
            polite_delay: Duration::from_millis(1500),
            max_retries: 3,
            http_timeout_secs: 60,
            user_agent: "salewatch-bot/0.1".to_string(),
            emit_empty_marker: false,
            missing_id_policy: MissingIdPolicy::AlwaysNew,
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("SALEWATCH_BASE_URL").unwrap_or(defaults.base_url),
            counties_path: std::env::var("SALEWATCH_COUNTIES")
                .map(PathBuf::from)
                .unwrap_or(defaults.counties_path),
            store_dir: std::env::var("SALEWATCH_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_dir),
            reports_dir: std::env::var("SALEWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            polite_delay: std::env::var("SALEWATCH_POLITE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.polite_delay),
            max_retries: std::env::var("SALEWATCH_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            http_timeout_secs: std::env::var("SALEWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("SALEWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            emit_empty_marker: std::env::var("SALEWATCH_EMPTY_MARKER")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.emit_empty_marker),
            missing_id_policy: std::env::var("SALEWATCH_MISSING_ID_POLICY")
                .map(|v| parse_missing_id_policy(&v))
                .unwrap_or(defaults.missing_id_policy),
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_retries,
            ..BackoffPolicy::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn merge_config(&self, label: impl Into<String>) -> MergeConfig {
        MergeConfig {
            emit_empty_marker: self.emit_empty_marker,
            missing_id_policy: self.missing_id_policy,
            ..MergeConfig::new(label)
        }
    }
}

pub fn parse_missing_id_policy(value: &str) -> MissingIdPolicy {
    match value.trim().to_ascii_lowercase().as_str() {
        "drop" => MissingIdPolicy::Drop,
        "always-new" | "always_new" | "" => MissingIdPolicy::AlwaysNew,
        other => {
            warn!(value = other, "unknown missing-id policy; using always-new");
            MissingIdPolicy::AlwaysNew
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupOutcome {
    Written { plan: PlanKind, new_records: usize },
    NoNewData,
    /// The source listed nothing; the tab was left alone.
    Empty,
    Failed { error: String },
}

impl GroupOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, GroupOutcome::Failed { .. })
    }

    pub fn new_records(&self) -> usize {
        match self {
            GroupOutcome::Written { new_records, .. } => *new_records,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReport {
    pub group_id: String,
    pub display_name: String,
    pub tab: String,
    pub records: usize,
    pub outcome: GroupOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub label: String,
    pub first_run: bool,
    pub groups_attempted: usize,
    pub groups_succeeded: usize,
    pub records_fetched: usize,
    pub total_new_records: usize,
    pub aggregate_new_records: usize,
    pub groups: Vec<GroupReport>,
    pub aggregate: GroupReport,
}

impl RunSummary {
    /// At least one county returned at least one record.
    pub fn has_usable_records(&self) -> bool {
        self.records_fetched > 0
    }

    pub fn failed_groups(&self) -> impl Iterator<Item = &GroupReport> {
        self.groups.iter().filter(|g| !g.outcome.is_success())
    }
}

pub struct RunOrchestrator {
    config: RunConfig,
    groups: Vec<GroupSource>,
    store: Arc<dyn TabularStore>,
    extractor: Box<dyn RecordExtractor>,
}

impl RunOrchestrator {
    pub fn new(
        config: RunConfig,
        groups: Vec<GroupSource>,
        store: Arc<dyn TabularStore>,
        extractor: Box<dyn RecordExtractor>,
    ) -> Self {
        Self {
            config,
            groups,
            store,
            extractor,
        }
    }

    /// One run labelled with today's date.
    pub async fn run_once(&self) -> RunSummary {
        self.run_labelled(snapshot_label_today()).await
    }

    pub async fn run_labelled(&self, label: String) -> RunSummary {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let engine = MergeEngine::new(self.config.merge_config(label.clone()));
        let first_run = !self.store.exists(ALL_DATA_TAB).await;
        info!(
            %run_id,
            extractor = self.extractor.name(),
            groups = self.groups.len(),
            first_run,
            %label,
            "starting run"
        );

        let mut reports = Vec::with_capacity(self.groups.len());
        let mut aggregate_batch: Vec<Record> = Vec::new();

        for (idx, group) in self.groups.iter().enumerate() {
            if idx > 0 && !self.config.polite_delay.is_zero() {
                tokio::time::sleep(self.config.polite_delay).await;
            }
            let span = info_span!("group", county = %group.display_name, county_id = %group.id);
            let report = self
                .process_group(&engine, group, first_run, &mut aggregate_batch)
                .instrument(span)
                .await;
            reports.push(report);
        }

        let aggregate = self
            .process_aggregate(&engine, first_run, &aggregate_batch)
            .instrument(info_span!("aggregate", tab = ALL_DATA_TAB))
            .await;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            label,
            first_run,
            groups_attempted: reports.len(),
            groups_succeeded: reports.iter().filter(|r| r.outcome.is_success()).count(),
            records_fetched: reports.iter().map(|r| r.records).sum(),
            total_new_records: reports.iter().map(|r| r.outcome.new_records()).sum(),
            aggregate_new_records: aggregate.outcome.new_records(),
            groups: reports,
            aggregate,
        };
        info!(
            %run_id,
            attempted = summary.groups_attempted,
            succeeded = summary.groups_succeeded,
            new_records = summary.total_new_records,
            aggregate_new_records = summary.aggregate_new_records,
            "run finished"
        );

        if let Err(err) = write_reports(&self.config.reports_dir, &summary).await {
            let error = format!("{err:#}");
            warn!(%error, "failed to write run reports");
        }
        summary
    }

    async fn process_group(
        &self,
        engine: &MergeEngine,
        group: &GroupSource,
        all_data_first_run: bool,
        aggregate_batch: &mut Vec<Record>,
    ) -> GroupReport {
        let tab = group.tab_title();
        let mut report = GroupReport {
            group_id: group.id.clone(),
            display_name: group.display_name.clone(),
            tab: tab.clone(),
            records: 0,
            outcome: GroupOutcome::Empty,
        };

        let records = match self.extractor.fetch(group).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "extraction failed; skipping county");
                report.outcome = GroupOutcome::Failed { error: err.to_string() };
                return report;
            }
        };
        report.records = records.len();
        if records.is_empty() {
            info!("no listings");
            return report;
        }

        let first_run = all_data_first_run || !self.store.exists(&tab).await;
        let outcome = self.write_plan(engine, &tab, first_run, &records, false).await;
        if let GroupOutcome::Failed { error } = &outcome {
            warn!(%error, "writing county tab failed");
        }
        report.outcome = outcome;
        aggregate_batch.extend(records);
        report
    }

    async fn process_aggregate(
        &self,
        engine: &MergeEngine,
        first_run: bool,
        batch: &[Record],
    ) -> GroupReport {
        let mut report = GroupReport {
            group_id: String::new(),
            display_name: ALL_DATA_TAB.to_string(),
            tab: ALL_DATA_TAB.to_string(),
            records: batch.len(),
            outcome: GroupOutcome::Empty,
        };
        if batch.is_empty() {
            warn!("no records from any county; leaving aggregate untouched");
            return report;
        }
        report.outcome = self.write_plan(engine, ALL_DATA_TAB, first_run, batch, true).await;
        if let GroupOutcome::Failed { error } = &report.outcome {
            warn!(%error, "writing aggregate tab failed");
        }
        report
    }

    async fn write_plan(
        &self,
        engine: &MergeEngine,
        tab: &str,
        first_run: bool,
        records: &[Record],
        aggregate: bool,
    ) -> GroupOutcome {
        let existing = if first_run {
            Vec::new()
        } else {
            self.store.read_all(tab).await
        };
        let plan = if aggregate {
            engine.merge_aggregate(tab, first_run, records, &existing)
        } else {
            engine.merge(tab, first_run, records, &existing)
        };

        match self.apply(tab, &plan, &existing).await {
            Ok(()) if plan.kind() == PlanKind::NoOp => GroupOutcome::NoNewData,
            Ok(()) => GroupOutcome::Written {
                plan: plan.kind(),
                new_records: plan.new_records(),
            },
            Err(err) => GroupOutcome::Failed {
                error: format!("{err:#}"),
            },
        }
    }

    async fn apply(&self, tab: &str, plan: &WritePlan, existing: &[Vec<String>]) -> Result<()> {
        // Render before clearing so a failure here leaves the tab untouched.
        let Some(rows) = plan.render(existing) else {
            return Ok(());
        };
        self.store
            .create_if_missing(tab)
            .await
            .with_context(|| format!("creating tab {tab}"))?;
        self.store
            .clear(tab)
            .await
            .with_context(|| format!("clearing tab {tab}"))?;
        self.store
            .write_from(tab, CellAnchor::ORIGIN, &rows)
            .await
            .with_context(|| format!("writing tab {tab}"))?;

        let columns = plan.header().map(|h| h.len()).unwrap_or(0);
        if let Err(err) = self
            .store
            .apply_presentation(tab, &Presentation::snapshot_block(columns))
            .await
        {
            warn!(tab, error = %err, "presentation not applied");
        }
        info!(tab, plan = ?plan.kind(), rows = rows.len(), "tab written");
        Ok(())
    }
}

pub async fn write_reports(reports_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(reports_dir)
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let line = |report: &GroupReport| {
        let outcome = match &report.outcome {
            GroupOutcome::Written { plan, new_records } => {
                format!("{} new ({})", new_records, plan_name(*plan))
            }
            GroupOutcome::NoNewData => "no new data".to_string(),
            GroupOutcome::Empty => "no listings".to_string(),
            GroupOutcome::Failed { error } => format!("FAILED: {error}"),
        };
        format!("- {} ({} fetched): {}", report.display_name, report.records, outcome)
    };

    format!(
        "# Sale Watch Run Brief\n\n- Run ID: `{}`\n- Label: {}\n- Started: {}\n- Finished: {}\n- First run: {}\n- Counties: {}/{} succeeded\n- Records fetched: {}\n- New records: {}\n\n## Counties\n{}\n\n## {}\n{}\n",
        summary.run_id,
        summary.label,
        summary.started_at,
        summary.finished_at,
        summary.first_run,
        summary.groups_succeeded,
        summary.groups_attempted,
        summary.records_fetched,
        summary.total_new_records,
        summary.groups.iter().map(line).collect::<Vec<_>>().join("\n"),
        ALL_DATA_TAB,
        line(&summary.aggregate),
    )
}

fn plan_name(plan: PlanKind) -> &'static str {
    match plan {
        PlanKind::FullOverwrite => "full overwrite",
        PlanKind::Prepend => "prepend",
        PlanKind::MigrateAndWrite => "migrated",
        PlanKind::NoOp => "no-op",
    }
}

/// Build the store and extractor a config describes and run once.
///
/// With `fixtures` set, pages come from saved HTML under that directory
/// instead of the live site.
pub async fn run_once_from_config(
    config: RunConfig,
    fixtures: Option<PathBuf>,
) -> Result<RunSummary> {
    let registry = CountyRegistry::load(&config.counties_path).await?;
    let groups = registry.enabled_groups();
    let store: Arc<dyn TabularStore> = Arc::new(JsonFileTabStore::new(config.store_dir.clone()));
    let extractor: Box<dyn RecordExtractor> = match fixtures {
        Some(dir) => Box::new(fixture_extractor(dir)?),
        None => {
            let http = HttpFetcher::new(config.http_client_config())?;
            Box::new(live_extractor(http, &config.base_url, config.backoff())?)
        }
    };
    let orchestrator = RunOrchestrator::new(config, groups, store, extractor);
    Ok(orchestrator.run_once().await)
}
