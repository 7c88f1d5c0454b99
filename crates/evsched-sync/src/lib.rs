//! Sync run orchestration: schedule pipeline, store merge, and the per-run session.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use evsched_adapters::{
    base_schedule_adapter, master_rank_schedule_adapter, AdapterContext, AdapterError,
    ScheduleAdapter, BASE_SCHEDULE_URL, MASTER_RANK_SCHEDULE_URL,
};
use evsched_core::{EventConfig, EventRecord, Tag, TargetZone};
use evsched_storage::{GridSheet, HttpClientConfig, HttpFetcher, PageFetcher, Sheet, Workbook};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evsched-sync";

pub const EVENTS_SHEET: &str = "Events";
pub const CONFIG_SHEET: &str = "Config";

/// Value written to the status column when a row is first created.
pub const STATUS_UNCHECKED: &str = "FALSE";

/// Header names of the `Events` sheet.
pub mod column {
    pub const TITLE: &str = "Title";
    pub const LEVEL: &str = "★";
    pub const START: &str = "Start";
    pub const END: &str = "End";
    pub const DESCRIPTION: &str = "Description";
    pub const STATUS: &str = "✔";
    pub const NOTES: &str = "Notes";
    pub const TAGS: &str = "Tags";

    pub const ALL: [&str; 8] = [TITLE, LEVEL, START, END, DESCRIPTION, STATUS, NOTES, TAGS];
}

/// Headers and keys of the `Config` sheet.
pub mod config_key {
    pub const KEY_HEADER: &str = "Key";
    pub const VALUE_HEADER: &str = "Value";
    pub const TIMEZONE: &str = "Timezone";
    pub const IGNORE_TAGS: &str = "Ignore Tags";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no sheet named `{0}`")]
    MissingSheet(String),
    #[error("sheet `{sheet}` has no column headed `{header}`")]
    MissingHeader { sheet: String, header: String },
    #[error("config key `{0}` not found in sheet")]
    MissingKey(String),
    #[error("invalid timezone `{0}`")]
    InvalidTimezone(String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workbook_path: PathBuf,
    pub base_schedule_url: String,
    pub master_rank_schedule_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workbook_path: std::env::var("EVSCHED_WORKBOOK")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./workbook.json")),
            base_schedule_url: std::env::var("EVSCHED_BASE_URL")
                .unwrap_or_else(|_| BASE_SCHEDULE_URL.to_string()),
            master_rank_schedule_url: std::env::var("EVSCHED_MASTER_URL")
                .unwrap_or_else(|_| MASTER_RANK_SCHEDULE_URL.to_string()),
            user_agent: std::env::var("EVSCHED_USER_AGENT")
                .unwrap_or_else(|_| "evsched-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("EVSCHED_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("EVSCHED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("EVSCHED_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
        }
    }
}

/// Column positions of the `Events` sheet, resolved by header name once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventColumns {
    pub title: usize,
    pub level: usize,
    pub start: usize,
    pub end: usize,
    pub description: usize,
    pub status: usize,
    pub notes: usize,
    pub tags: usize,
}

impl EventColumns {
    pub fn resolve(sheet: &dyn Sheet) -> Result<Self, ConfigError> {
        let find = |header: &str| named_column(sheet, header);
        Ok(Self {
            title: find(column::TITLE)?,
            level: find(column::LEVEL)?,
            start: find(column::START)?,
            end: find(column::END)?,
            description: find(column::DESCRIPTION)?,
            status: find(column::STATUS)?,
            notes: find(column::NOTES)?,
            tags: find(column::TAGS)?,
        })
    }
}

fn named_column(sheet: &dyn Sheet, header: &str) -> Result<usize, ConfigError> {
    sheet
        .find_column_by_header(header)
        .ok_or_else(|| ConfigError::MissingHeader {
            sheet: sheet.name().to_string(),
            header: header.to_string(),
        })
}

/// Reads the `Config` sheet's key/value rows into a validated config.
pub fn load_event_config(sheet: &dyn Sheet) -> Result<EventConfig, ConfigError> {
    let key_col = named_column(sheet, config_key::KEY_HEADER)?;
    let value_col = named_column(sheet, config_key::VALUE_HEADER)?;
    let lookup = |key: &str| -> Result<String, ConfigError> {
        let row = sheet
            .find_row_by_cell_value(key_col, key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        let value = sheet.get_cell(row, value_col).to_string();
        info!(key, value = %value, "loaded config property");
        Ok(value)
    };

    let raw_timezone = lookup(config_key::TIMEZONE)?;
    let timezone = raw_timezone
        .parse::<TargetZone>()
        .map_err(|_| ConfigError::InvalidTimezone(raw_timezone.clone()))?;
    let ignore_tags = parse_ignore_tags(&lookup(config_key::IGNORE_TAGS)?);

    Ok(EventConfig {
        timezone,
        ignore_tags,
    })
}

/// Comma-separated tag names; blanks are skipped and unknown names can never match.
pub fn parse_ignore_tags(raw: &str) -> BTreeSet<Tag> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .filter_map(|name| match name.parse::<Tag>() {
            Ok(tag) => Some(tag),
            Err(err) => {
                warn!(%err, "ignoring unknown tag in config");
                None
            }
        })
        .collect()
}

/// Orders records by start instant. Equal starts keep their encounter order.
pub fn sort_by_start(mut events: Vec<EventRecord>) -> Vec<EventRecord> {
    events.sort_by_key(|e| e.starts_at);
    events
}

/// Keeps the first record seen for each title.
pub fn dedup_by_title(events: Vec<EventRecord>) -> Vec<EventRecord> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|e| seen.insert(e.title.clone()))
        .collect()
}

/// Drops records carrying any ignored tag.
pub fn filter_ignored(events: Vec<EventRecord>, config: &EventConfig) -> Vec<EventRecord> {
    events.into_iter().filter(|e| !config.is_ignored(e)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    pub fetched_pages: usize,
    pub extracted_events: usize,
    pub events: Vec<EventRecord>,
}

/// Fetches every schedule page in order and reduces the rows to the record set to merge.
pub struct EventPipeline<'a> {
    http: &'a dyn PageFetcher,
    adapters: &'a [Box<dyn ScheduleAdapter>],
}

impl<'a> EventPipeline<'a> {
    pub fn new(http: &'a dyn PageFetcher, adapters: &'a [Box<dyn ScheduleAdapter>]) -> Self {
        Self { http, adapters }
    }

    pub async fn run(
        &self,
        ctx: &AdapterContext,
        config: &EventConfig,
    ) -> Result<PipelineOutput, AdapterError> {
        let mut fetched_pages = 0usize;
        let mut events = Vec::new();
        for adapter in self.adapters {
            let page = adapter.fetch_page(self.http, ctx).await?;
            fetched_pages += 1;
            events.extend(adapter.parse_page(&page, ctx)?);
        }

        let extracted_events = events.len();
        let events = filter_ignored(dedup_by_title(sort_by_start(events)), config);
        info!(
            fetched_pages,
            extracted_events,
            kept_events = events.len(),
            "schedule pipeline finished"
        );
        Ok(PipelineOutput {
            fetched_pages,
            extracted_events,
            events,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MergeOutcome {
    Created { row: usize },
    Updated { row: usize },
    Unchanged { row: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Upserts records into the events sheet by title. Only source-owned columns are
/// written; status and notes belong to whoever maintains the sheet.
pub struct MergeEngine<'s> {
    sheet: &'s mut dyn Sheet,
    columns: EventColumns,
}

impl<'s> MergeEngine<'s> {
    pub fn new(sheet: &'s mut dyn Sheet, columns: EventColumns) -> Self {
        Self { sheet, columns }
    }

    pub fn upsert(&mut self, event: &EventRecord) -> MergeOutcome {
        let existing = self
            .sheet
            .find_row_by_cell_value(self.columns.title, &event.title);
        let row = existing.unwrap_or_else(|| self.sheet.row_count());

        let cells = [
            (self.columns.title, event.title.clone()),
            (self.columns.start, event.start_date.clone()),
            (self.columns.level, event.level.clone()),
            (self.columns.end, event.end_date.clone()),
            (self.columns.description, event.description.clone()),
            (self.columns.tags, event.tags_display()),
        ];
        let mut changed = false;
        for (col, value) in &cells {
            if self.sheet.get_cell(row, *col) != value.as_str() {
                changed = true;
            }
            self.sheet.set_cell(row, *col, value);
        }

        match existing {
            None => {
                self.sheet
                    .set_cell(row, self.columns.status, STATUS_UNCHECKED);
                MergeOutcome::Created { row }
            }
            Some(row) if changed => MergeOutcome::Updated { row },
            Some(row) => MergeOutcome::Unchanged { row },
        }
    }

    pub fn merge_all(&mut self, events: &[EventRecord]) -> MergeReport {
        let mut report = MergeReport::default();
        for event in events {
            match self.upsert(event) {
                MergeOutcome::Created { row } => {
                    info!(title = %event.title, row, "created event row");
                    report.created += 1;
                }
                MergeOutcome::Updated { row } => {
                    info!(title = %event.title, row, "updated event row");
                    report.updated += 1;
                }
                MergeOutcome::Unchanged { .. } => report.unchanged += 1,
            }
        }
        report
    }
}

/// Everything one run needs from the store: the workbook, resolved event columns,
/// and the validated config. Built at run start, dropped at run end.
#[derive(Debug)]
pub struct SheetSession {
    workbook: Workbook,
    columns: EventColumns,
    config: EventConfig,
}

impl SheetSession {
    pub fn open(workbook: Workbook) -> Result<Self, ConfigError> {
        let events = workbook
            .sheet(EVENTS_SHEET)
            .ok_or_else(|| ConfigError::MissingSheet(EVENTS_SHEET.to_string()))?;
        let columns = EventColumns::resolve(events)?;
        let config_sheet = workbook
            .sheet(CONFIG_SHEET)
            .ok_or_else(|| ConfigError::MissingSheet(CONFIG_SHEET.to_string()))?;
        let config = load_event_config(config_sheet)?;
        Ok(Self {
            workbook,
            columns,
            config,
        })
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    pub fn columns(&self) -> EventColumns {
        self.columns
    }

    pub fn merge(&mut self, events: &[EventRecord]) -> Result<MergeReport, ConfigError> {
        let sheet = self
            .workbook
            .sheet_mut(EVENTS_SHEET)
            .ok_or_else(|| ConfigError::MissingSheet(EVENTS_SHEET.to_string()))?;
        Ok(MergeEngine::new(sheet, self.columns).merge_all(events))
    }

    pub fn into_workbook(self) -> Workbook {
        self.workbook
    }
}

/// Empty store with the expected headers and config keys.
pub fn workbook_template() -> Workbook {
    Workbook::new(vec![
        GridSheet::from_rows(EVENTS_SHEET, vec![column::ALL.to_vec()]),
        GridSheet::from_rows(
            CONFIG_SHEET,
            vec![
                vec![config_key::KEY_HEADER, config_key::VALUE_HEADER],
                vec![config_key::TIMEZONE, "Z"],
                vec![config_key::IGNORE_TAGS, ""],
            ],
        ),
    ])
}

pub async fn init_workbook(path: impl AsRef<Path>, force: bool) -> Result<()> {
    let path = path.as_ref();
    if !force && tokio::fs::try_exists(path).await.unwrap_or(false) {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    workbook_template().save(path).await?;
    info!(path = %path.display(), "initialised workbook");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_pages: usize,
    pub extracted_events: usize,
    pub kept_events: usize,
    pub created_rows: usize,
    pub updated_rows: usize,
    pub unchanged_rows: usize,
}

pub struct SyncRunner {
    config: SyncConfig,
    http: Box<dyn PageFetcher>,
    adapters: Vec<Box<dyn ScheduleAdapter>>,
    run_lock: Mutex<()>,
}

impl SyncRunner {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let adapters: Vec<Box<dyn ScheduleAdapter>> = vec![
            Box::new(base_schedule_adapter(config.base_schedule_url.clone())),
            Box::new(master_rank_schedule_adapter(
                config.master_rank_schedule_url.clone(),
            )),
        ];
        Ok(Self {
            config,
            http: Box::new(http),
            adapters,
            run_lock: Mutex::new(()),
        })
    }

    pub fn with_fetcher(mut self, http: Box<dyn PageFetcher>) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_once_at(Utc::now()).await
    }

    /// One full update with `now` as the run's current time. Runs never overlap.
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async move {
            let path = &self.config.workbook_path;
            let workbook = Workbook::load(path).await?;
            let mut session = SheetSession::open(workbook)?;
            let ctx = AdapterContext::new(run_id, now, session.config().timezone);

            let output = EventPipeline::new(self.http.as_ref(), &self.adapters)
                .run(&ctx, session.config())
                .await
                .context("loading schedule events")?;
            let report = session.merge(&output.events)?;
            session
                .into_workbook()
                .save(path)
                .await
                .context("saving merged workbook")?;

            let summary = SyncRunSummary {
                run_id,
                started_at: now,
                finished_at: Utc::now(),
                fetched_pages: output.fetched_pages,
                extracted_events: output.extracted_events,
                kept_events: output.events.len(),
                created_rows: report.created,
                updated_rows: report.updated,
                unchanged_rows: report.unchanged,
            };
            info!(
                created = report.created,
                updated = report.updated,
                unchanged = report.unchanged,
                "update complete"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

pub async fn run_update_from_env() -> Result<SyncRunSummary> {
    SyncRunner::new(SyncConfig::from_env())?.run_once().await
}

/// Scheduler that triggers the same update on the configured cron, or `None`
/// when scheduling is switched off.
pub async fn maybe_build_scheduler(runner: Arc<SyncRunner>) -> Result<Option<JobScheduler>> {
    if !runner.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = runner.config().sync_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            match runner.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled update finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled update failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evsched_adapters::{BASE_SCHEDULE_SOURCE, MASTER_RANK_SCHEDULE_SOURCE};
    use evsched_storage::StaticPageFetcher;
    use tempfile::tempdir;

    const BASE_URL: &str = "http://schedule.test/schedule.html?utc=0";
    const MASTER_URL: &str = "http://schedule.test/schedule-master.html?utc=0";

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, day, hour, 0, 0).single().unwrap()
    }

    fn mk_event(title: &str, starts_at: DateTime<Utc>, tags: &[Tag]) -> EventRecord {
        EventRecord {
            source_id: BASE_SCHEDULE_SOURCE.to_string(),
            title: title.to_string(),
            description: format!("{title} description"),
            level: "9★".to_string(),
            start_date: starts_at.format("%m/%d/%Y %I:%M%p").to_string(),
            end_date: starts_at.format("%m/%d/%Y %I:%M%p").to_string(),
            starts_at,
            ends_at: starts_at,
            tags: tags.iter().copied().collect(),
        }
    }

    fn events_sheet(header: &[&str]) -> GridSheet {
        GridSheet::from_rows(EVENTS_SHEET, vec![header.to_vec()])
    }

    fn config_sheet(timezone: &str, ignore: &str) -> GridSheet {
        GridSheet::from_rows(
            CONFIG_SHEET,
            vec![
                vec!["Key", "Value"],
                vec!["Timezone", timezone],
                vec!["Ignore Tags", ignore],
            ],
        )
    }

    fn fixture(source_id: &str) -> String {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        std::fs::read_to_string(root.join("fixtures").join(source_id).join("sample/page.html"))
            .expect("fixture page")
    }

    fn test_runner(workbook_path: PathBuf, fetcher: StaticPageFetcher) -> SyncRunner {
        SyncRunner::new(SyncConfig {
            workbook_path,
            base_schedule_url: BASE_URL.to_string(),
            master_rank_schedule_url: MASTER_URL.to_string(),
            user_agent: "evsched-test".to_string(),
            http_timeout_secs: 1,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
        })
        .unwrap()
        .with_fetcher(Box::new(fetcher))
    }

    #[test]
    fn sort_is_by_instant_and_stable_for_ties() {
        let events = vec![
            mk_event("late", at(9, 0), &[]),
            mk_event("tie-a", at(2, 0), &[]),
            mk_event("early", at(1, 0), &[]),
            mk_event("tie-b", at(2, 0), &[]),
        ];
        let titles = sort_by_start(events)
            .into_iter()
            .map(|e| e.title)
            .collect::<Vec<_>>();
        assert_eq!(titles, ["early", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn dedup_keeps_chronologically_earliest_title() {
        let events = vec![
            mk_event("Dup", at(8, 0), &[Tag::Xbox]),
            mk_event("Other", at(3, 0), &[]),
            mk_event("Dup", at(2, 0), &[Tag::New]),
        ];
        let kept = dedup_by_title(sort_by_start(events));
        let dups = kept.iter().filter(|e| e.title == "Dup").collect::<Vec<_>>();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].starts_at, at(2, 0));
        assert_eq!(dups[0].tags, [Tag::New].into_iter().collect());
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn filter_keeps_record_iff_no_tag_is_ignored() {
        let ignore: BTreeSet<Tag> = [Tag::Xbox, Tag::Collab].into_iter().collect();
        let config = EventConfig {
            timezone: TargetZone::utc(),
            ignore_tags: ignore.clone(),
        };
        let events = vec![
            mk_event("untagged", at(1, 0), &[]),
            mk_event("outside", at(1, 0), &[Tag::New, Tag::PS4]),
            mk_event("partly", at(1, 0), &[Tag::New, Tag::Xbox]),
            mk_event("fully", at(1, 0), &[Tag::Collab]),
        ];
        let kept = filter_ignored(events.clone(), &config);
        for event in &events {
            let present = kept.iter().any(|k| k.title == event.title);
            assert_eq!(present, event.tags.is_disjoint(&ignore), "{}", event.title);
        }
        let keep_all = EventConfig {
            timezone: TargetZone::utc(),
            ignore_tags: BTreeSet::new(),
        };
        assert_eq!(filter_ignored(events.clone(), &keep_all).len(), events.len());
    }

    #[test]
    fn config_sheet_parses_timezone_and_ignore_tags() {
        let config = load_event_config(&config_sheet(" -05:00 ", " PS4 , xbox,, Switch")).unwrap();
        assert_eq!(config.timezone, "-05:00".parse::<TargetZone>().unwrap());
        assert_eq!(config.ignore_tags, [Tag::PS4, Tag::Xbox].into_iter().collect());

        let config = load_event_config(&config_sheet("America/New_York", "")).unwrap();
        assert!(config.ignore_tags.is_empty());
    }

    #[test]
    fn config_sheet_failures_are_named() {
        let missing_key = GridSheet::from_rows(
            CONFIG_SHEET,
            vec![vec!["Key", "Value"], vec!["Timezone", "Z"]],
        );
        assert_eq!(
            load_event_config(&missing_key),
            Err(ConfigError::MissingKey("Ignore Tags".to_string()))
        );

        assert_eq!(
            load_event_config(&config_sheet("Nowhere/Special", "")),
            Err(ConfigError::InvalidTimezone("Nowhere/Special".to_string()))
        );
        assert!(matches!(
            load_event_config(&config_sheet("", "")),
            Err(ConfigError::InvalidTimezone(_))
        ));

        let no_value_header = GridSheet::from_rows(CONFIG_SHEET, vec![vec!["Key", "Setting"]]);
        assert_eq!(
            load_event_config(&no_value_header),
            Err(ConfigError::MissingHeader {
                sheet: CONFIG_SHEET.to_string(),
                header: "Value".to_string(),
            })
        );
    }

    #[test]
    fn columns_resolve_by_header_in_any_order() {
        let reordered = events_sheet(&["Notes", "Tags", "✔", "End", "Start", "★", "Description", "Title"]);
        let columns = EventColumns::resolve(&reordered).unwrap();
        assert_eq!(columns.title, 7);
        assert_eq!(columns.notes, 0);
        assert_eq!(columns.level, 5);

        let missing = events_sheet(&["Title", "★", "Start", "End", "Description", "✔", "Notes"]);
        assert_eq!(
            EventColumns::resolve(&missing),
            Err(ConfigError::MissingHeader {
                sheet: EVENTS_SHEET.to_string(),
                header: "Tags".to_string(),
            })
        );
    }

    #[test]
    fn upsert_creates_row_with_unchecked_status() {
        let mut sheet = events_sheet(&column::ALL);
        let columns = EventColumns::resolve(&sheet).unwrap();
        let event = mk_event("Fresh Quest", at(1, 0), &[Tag::New, Tag::PS4]);

        let outcome = MergeEngine::new(&mut sheet, columns).upsert(&event);
        assert_eq!(outcome, MergeOutcome::Created { row: 1 });
        assert_eq!(sheet.row_count(), 2);
        assert_eq!(sheet.get_cell(1, columns.title), "Fresh Quest");
        assert_eq!(sheet.get_cell(1, columns.status), STATUS_UNCHECKED);
        assert_eq!(sheet.get_cell(1, columns.notes), "");
        assert_eq!(sheet.get_cell(1, columns.tags), "New, PS4");
        assert_eq!(sheet.get_cell(1, columns.level), "9★");
    }

    #[test]
    fn blank_title_never_claims_an_untitled_operator_row() {
        let mut sheet = events_sheet(&column::ALL);
        let columns = EventColumns::resolve(&sheet).unwrap();
        sheet.set_cell(1, columns.status, "TRUE");
        sheet.set_cell(1, columns.notes, "operator scratch row");
        let scratch = sheet.rows[1].clone();

        let outcome = MergeEngine::new(&mut sheet, columns).upsert(&mk_event("", at(1, 0), &[]));
        assert_eq!(outcome, MergeOutcome::Created { row: 2 });
        assert_eq!(sheet.rows[1], scratch);
    }

    #[tokio::test]
    async fn blank_titled_schedule_row_aborts_the_run() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("workbook.json");
        init_workbook(&path, false).await.unwrap();
        let before = Workbook::load(&path).await.unwrap();

        let blank_title_page = fixture(BASE_SCHEDULE_SOURCE).replacen(
            "Reveal Thyself, Destroyer",
            "",
            1,
        );
        let fetcher = StaticPageFetcher::new()
            .with_page(BASE_URL, blank_title_page)
            .with_page(MASTER_URL, fixture(MASTER_RANK_SCHEDULE_SOURCE));
        let err = test_runner(path.clone(), fetcher)
            .run_once_at(at(15, 12))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AdapterError>(),
            Some(AdapterError::Extraction { .. })
        ));
        assert_eq!(Workbook::load(&path).await.unwrap(), before);
    }

    #[test]
    fn merge_is_idempotent_and_preserves_operator_columns() {
        let mut sheet = events_sheet(&column::ALL);
        let columns = EventColumns::resolve(&sheet).unwrap();
        sheet.set_cell(1, columns.title, "Known Quest");
        sheet.set_cell(1, columns.start, "stale");
        sheet.set_cell(1, columns.status, "TRUE");
        sheet.set_cell(1, columns.notes, "carved two gems");

        let events = vec![
            mk_event("Known Quest", at(1, 0), &[]),
            mk_event("New Quest", at(2, 0), &[Tag::Xbox]),
        ];

        let first = MergeEngine::new(&mut sheet, columns).merge_all(&events);
        assert_eq!(
            first,
            MergeReport {
                created: 1,
                updated: 1,
                unchanged: 0
            }
        );
        let after_first = sheet.clone();

        let second = MergeEngine::new(&mut sheet, columns).merge_all(&events);
        assert_eq!(
            second,
            MergeReport {
                created: 0,
                updated: 0,
                unchanged: 2
            }
        );
        assert_eq!(sheet, after_first);
        assert_eq!(sheet.row_count(), 3);
        assert_eq!(sheet.get_cell(1, columns.status), "TRUE");
        assert_eq!(sheet.get_cell(1, columns.notes), "carved two gems");
        assert_eq!(sheet.get_cell(1, columns.start), events[0].start_date);
    }

    #[test]
    fn session_requires_both_sheets() {
        let no_config = Workbook::new(vec![events_sheet(&column::ALL)]);
        assert_eq!(
            SheetSession::open(no_config).unwrap_err(),
            ConfigError::MissingSheet(CONFIG_SHEET.to_string())
        );
        let no_events = Workbook::new(vec![config_sheet("Z", "")]);
        assert_eq!(
            SheetSession::open(no_events).unwrap_err(),
            ConfigError::MissingSheet(EVENTS_SHEET.to_string())
        );
        let session = SheetSession::open(workbook_template()).unwrap();
        assert_eq!(session.config().timezone, TargetZone::utc());
        assert_eq!(session.columns().tags, 7);
    }

    #[tokio::test]
    async fn update_merges_both_schedules_into_workbook() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("workbook.json");

        let mut workbook = Workbook::new(vec![
            events_sheet(&column::ALL),
            config_sheet("-05:00", "Collab"),
        ]);
        {
            let events = workbook.sheet_mut(EVENTS_SHEET).unwrap();
            events.set_cell(1, 0, "Reveal Thyself, Destroyer");
            events.set_cell(1, 2, "01/01/2024 12:00AM");
            events.set_cell(1, 5, "TRUE");
            events.set_cell(1, 6, "farmed");
        }
        workbook.save(&path).await.unwrap();

        let fetcher = StaticPageFetcher::new()
            .with_page(BASE_URL, fixture(BASE_SCHEDULE_SOURCE))
            .with_page(MASTER_URL, fixture(MASTER_RANK_SCHEDULE_SOURCE));
        let runner = test_runner(path.clone(), fetcher);
        let now = at(15, 12);

        let summary = runner.run_once_at(now).await.unwrap();
        assert_eq!(summary.fetched_pages, 2);
        assert_eq!(summary.extracted_events, 5);
        assert_eq!(summary.kept_events, 3);
        assert_eq!(summary.created_rows, 2);
        assert_eq!(summary.updated_rows, 1);

        let saved = Workbook::load(&path).await.unwrap();
        let sheet = saved.sheet(EVENTS_SHEET).unwrap();
        assert_eq!(
            sheet.rows[1],
            vec![
                "Reveal Thyself, Destroyer",
                "9★",
                "08/31/2024 07:00PM",
                "09/07/2024 06:59PM",
                "Only the mightiest hunters may face the Destroyer. Slay a Nergigante.",
                "TRUE",
                "farmed",
                "New, PS4",
            ]
        );
        assert_eq!(
            sheet.rows[2],
            vec![
                "The Food Chain Dominator",
                "8★",
                "08/24/2024 07:00PM",
                "08/31/2024 06:59PM",
                "Hunt a Deviljho in the Elder's Recess.",
                "FALSE",
                "",
                "Xbox",
            ]
        );
        assert_eq!(sheet.get_cell(3, 0), "A Sight to Behold");
        assert_eq!(sheet.get_cell(3, 1), "24✪");
        assert_eq!(sheet.get_cell(3, 7), "New, PS4");
        assert_eq!(sheet.row_count(), 4);
        assert!(sheet.find_row_by_cell_value(0, "Code Red").is_none());

        let rerun = runner.run_once_at(now).await.unwrap();
        assert_eq!(rerun.created_rows, 0);
        assert_eq!(rerun.updated_rows, 0);
        assert_eq!(rerun.unchanged_rows, 3);
        assert_eq!(Workbook::load(&path).await.unwrap(), saved);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_before_touching_the_store() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("workbook.json");
        init_workbook(&path, false).await.unwrap();
        let before = Workbook::load(&path).await.unwrap();

        let fetcher = StaticPageFetcher::new().with_page(BASE_URL, fixture(BASE_SCHEDULE_SOURCE));
        let err = test_runner(path.clone(), fetcher)
            .run_once_at(at(15, 12))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AdapterError>(),
            Some(AdapterError::Fetch(_))
        ));
        assert_eq!(Workbook::load(&path).await.unwrap(), before);
    }

    #[tokio::test]
    async fn init_refuses_to_overwrite_without_force() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("workbook.json");
        init_workbook(&path, false).await.unwrap();
        assert!(init_workbook(&path, false).await.is_err());
        init_workbook(&path, true).await.unwrap();
        assert_eq!(Workbook::load(&path).await.unwrap(), workbook_template());
    }

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let dir = tempdir().expect("tempdir");
        let runner = Arc::new(test_runner(
            dir.path().join("workbook.json"),
            StaticPageFetcher::new(),
        ));
        assert!(maybe_build_scheduler(runner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_config_key_is_a_config_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("workbook.json");
        Workbook::new(vec![
            events_sheet(&column::ALL),
            GridSheet::from_rows(CONFIG_SHEET, vec![vec!["Key", "Value"]]),
        ])
        .save(&path)
        .await
        .unwrap();

        let err = test_runner(path, StaticPageFetcher::new())
            .run_once_at(at(15, 12))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingKey("Timezone".to_string()))
        );
    }
}
