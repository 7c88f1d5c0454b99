//! Schedule page adapters: markup extraction and field normalization.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use evsched_core::{EventRecord, Tag, TargetZone, DISPLAY_DATE_FORMAT};
use evsched_storage::{FetchError, PageFetcher};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evsched-adapters";

pub const BASE_SCHEDULE_SOURCE: &str = "base-schedule";
pub const MASTER_RANK_SCHEDULE_SOURCE: &str = "master-rank-schedule";
pub const BASE_SCHEDULE_URL: &str = "http://game.capcom.com/world/steam/us/schedule.html?utc=0";
pub const MASTER_RANK_SCHEDULE_URL: &str =
    "http://game.capcom.com/world/steam/us/schedule-master.html?utc=0";

/// Separator between the start and end token of a term.
pub const TERM_SEPARATOR: char = '〜';

macro_rules! selector {
    ($query:expr) => {{
        static SELECTOR: Lazy<Selector> =
            Lazy::new(|| Selector::parse($query).expect("static selector parses"));
        &SELECTOR
    }};
}

static UTC_ANNOTATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(UTC([^)]*)\)").expect("static regex compiles"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{within} is missing expected element `{selector}`")]
    Extraction {
        within: String,
        selector: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub source_id: String,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Per-run values every adapter needs: when the run started, the date used for
/// year inference, and the zone dates are rendered in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub target_zone: TargetZone,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, now: DateTime<Utc>, target_zone: TargetZone) -> Self {
        Self {
            run_id,
            fetched_at: now,
            today: target_zone.local_date(now),
            target_zone,
        }
    }
}

#[async_trait]
pub trait ScheduleAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn listing_url(&self) -> &str;

    async fn fetch_page(
        &self,
        http: &dyn PageFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_page(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventRecord>, AdapterError>;
}

/// Adapter for the schedule table markup shared by both schedule pages.
#[derive(Debug, Clone)]
pub struct HtmlScheduleAdapter {
    source_id: &'static str,
    url: String,
}

#[async_trait]
impl ScheduleAdapter for HtmlScheduleAdapter {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    fn listing_url(&self) -> &str {
        &self.url
    }

    async fn fetch_page(
        &self,
        http: &dyn PageFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let url = self.listing_url();
        let body = http.fetch_text(url).await?;
        debug!(source_id = self.source_id, url, bytes = body.len(), "fetched schedule page");
        Ok(FetchedPage {
            source_id: self.source_id.to_string(),
            url: url.to_string(),
            body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_page(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<EventRecord>, AdapterError> {
        if page.source_id != self.source_id {
            return Err(AdapterError::Parse(format!(
                "page source_id={} does not match adapter source_id={}",
                page.source_id, self.source_id
            )));
        }
        let document = Html::parse_document(&page.body);
        let source_offset = resolve_page_offset(&document)?;

        let events = document
            .select(selector!(".t1, .t2, .t3"))
            .enumerate()
            .map(|(idx, row)| extract_event(row, idx, self.source_id, &source_offset, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            source_id = self.source_id,
            source_offset = %source_offset,
            rows = events.len(),
            "parsed schedule page"
        );
        Ok(events)
    }
}

pub fn base_schedule_adapter(url: impl Into<String>) -> HtmlScheduleAdapter {
    HtmlScheduleAdapter {
        source_id: BASE_SCHEDULE_SOURCE,
        url: url.into(),
    }
}

pub fn master_rank_schedule_adapter(url: impl Into<String>) -> HtmlScheduleAdapter {
    HtmlScheduleAdapter {
        source_id: MASTER_RANK_SCHEDULE_SOURCE,
        url: url.into(),
    }
}

pub fn adapter_for_source(source_id: &str, url: &str) -> Option<Box<dyn ScheduleAdapter>> {
    match source_id {
        BASE_SCHEDULE_SOURCE => Some(Box::new(base_schedule_adapter(url))),
        MASTER_RANK_SCHEDULE_SOURCE => Some(Box::new(master_rank_schedule_adapter(url))),
        _ => None,
    }
}

fn has_class(el: ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn first_child_element(el: ElementRef<'_>) -> Option<ElementRef<'_>> {
    el.children().find_map(ElementRef::wrap)
}

fn find_first<'a>(
    scope: ElementRef<'a>,
    selector: &Selector,
    label: &'static str,
    within: &str,
) -> Result<ElementRef<'a>, AdapterError> {
    scope
        .select(selector)
        .next()
        .ok_or_else(|| AdapterError::Extraction {
            within: within.to_string(),
            selector: label,
        })
}

fn first_child_text(
    el: ElementRef<'_>,
    label: &'static str,
    within: &str,
) -> Result<String, AdapterError> {
    first_child_element(el)
        .map(|child| child.text().collect::<String>().trim().to_string())
        .ok_or_else(|| AdapterError::Extraction {
            within: within.to_string(),
            selector: label,
        })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve_page_offset(document: &Html) -> Result<String, AdapterError> {
    let terms = document
        .select(selector!(".terms"))
        .next()
        .ok_or_else(|| AdapterError::Extraction {
            within: "schedule page".to_string(),
            selector: ".terms",
        })?;
    let header = first_child_text(terms, ".terms > *", "schedule page")?;
    resolve_source_offset(&header)
}

/// Reads the `(UTC<offset>)` annotation out of `header` and returns it as `Z` or `±HH:MM`.
pub fn resolve_source_offset(header: &str) -> Result<String, AdapterError> {
    let caps = UTC_ANNOTATION.captures(header).ok_or_else(|| {
        AdapterError::Parse(format!("can't parse timezone annotation, raw value: {header:?}"))
    })?;
    let raw = caps[1].trim();
    if raw.is_empty() {
        return Ok("Z".to_string());
    }

    let (sign, digits) = if let Some(rest) = raw.strip_prefix('+') {
        ('+', rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        ('-', rest)
    } else {
        return Err(AdapterError::Parse(format!("unsigned utc offset {raw:?}")));
    };

    let all_digits = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());
    match digits.len() {
        1 if all_digits => Ok(format!("{sign}0{digits}:00")),
        2 if all_digits => Ok(format!("{sign}{digits}:00")),
        5 if digits.as_bytes()[2] == b':'
            && digits
                .chars()
                .enumerate()
                .all(|(i, c)| i == 2 || c.is_ascii_digit()) =>
        {
            Ok(format!("{sign}{digits}"))
        }
        _ => Err(AdapterError::Parse(format!("unsupported utc offset {raw:?}"))),
    }
}

/// Year a `month` token belongs to when read on `today`.
///
/// Late-year months seen during January or February refer to last year's schedule.
pub fn infer_year(month: u32, today: NaiveDate) -> i32 {
    if month >= 10 && today.month0() <= 1 {
        today.year() - 1
    } else {
        today.year()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DateToken {
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
}

impl DateToken {
    /// Parses `MM/DD HH:MM`.
    fn parse(token: &str) -> Result<Self, AdapterError> {
        let bad = || AdapterError::Parse(format!("date token {token:?} is not `MM/DD HH:MM`"));
        let (date, time) = token.trim().split_once(char::is_whitespace).ok_or_else(bad)?;
        let (month, day) = date.split_once('/').ok_or_else(bad)?;
        let (hour, minute) = time.trim().split_once(':').ok_or_else(bad)?;
        let number = |part: &str| -> Result<u32, AdapterError> {
            let part = part.trim();
            if part.is_empty() || part.len() > 2 || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(bad());
            }
            part.parse().map_err(|_| bad())
        };
        Ok(Self {
            month: number(month)?,
            day: number(day)?,
            hour: number(hour)?,
            minute: number(minute)?,
        })
    }

    fn instant(&self, year: i32, source_offset: &str) -> Result<DateTime<Utc>, AdapterError> {
        let iso = format!(
            "{year:04}-{:02}-{:02}T{:02}:{:02}:00{source_offset}",
            self.month, self.day, self.hour, self.minute
        );
        DateTime::parse_from_rfc3339(&iso)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| AdapterError::Parse(format!("invalid date {iso}: {e}")))
    }
}

/// An absolute instant together with its rendering in the target zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDate {
    pub instant: DateTime<Utc>,
    pub rendered: String,
}

impl NormalizedDate {
    fn new(instant: DateTime<Utc>, target: &TargetZone) -> Self {
        Self {
            instant,
            rendered: target.format_instant(instant, DISPLAY_DATE_FORMAT),
        }
    }
}

pub fn normalize_date(
    token: &str,
    source_offset: &str,
    target: &TargetZone,
    today: NaiveDate,
) -> Result<NormalizedDate, AdapterError> {
    let parsed = DateToken::parse(token)?;
    let instant = parsed.instant(infer_year(parsed.month, today), source_offset)?;
    Ok(NormalizedDate::new(instant, target))
}

/// Normalizes a `start〜end` term. An end that would land before its start is
/// taken to be in the following year.
pub fn normalize_term(
    term: &str,
    source_offset: &str,
    target: &TargetZone,
    today: NaiveDate,
) -> Result<(NormalizedDate, NormalizedDate), AdapterError> {
    let mut parts = term.split(TERM_SEPARATOR);
    let (Some(start_token), Some(end_token), None) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(AdapterError::Parse(format!(
            "term {term:?} is not a `start{TERM_SEPARATOR}end` pair"
        )));
    };

    let start = normalize_date(start_token, source_offset, target, today)?;
    let end_parsed = DateToken::parse(end_token)?;
    let end_year = infer_year(end_parsed.month, today);
    let mut end_instant = end_parsed.instant(end_year, source_offset)?;
    if end_instant < start.instant {
        end_instant = end_parsed.instant(end_year + 1, source_offset)?;
    }
    Ok((start, NormalizedDate::new(end_instant, target)))
}

/// `"3"` → `"3★"`, `"MR 1★"` → `"1✪"`.
pub fn format_level(raw: &str) -> String {
    let level = raw.replace('★', "");
    let level = level.trim();
    if level.contains("MR") {
        format!("{}✪", level.replacen("MR", "", 1).trim())
    } else {
        format!("{level}★")
    }
}

fn tag_rule(tag: Tag, row: ElementRef<'_>) -> bool {
    match tag {
        Tag::New => has_class(row, "new"),
        Tag::PS4 => row.select(selector!(".ps4")).next().is_some(),
        Tag::Xbox => row.select(selector!(".xbox")).next().is_some(),
        Tag::Collab => has_class(row, "sc"),
    }
}

pub fn classify_tags(row: ElementRef<'_>) -> BTreeSet<Tag> {
    Tag::ALL
        .into_iter()
        .filter(|tag| tag_rule(*tag, row))
        .collect()
}

/// Builds one record from a schedule row. Any missing region fails the whole row.
pub fn extract_event(
    row: ElementRef<'_>,
    row_index: usize,
    source_id: &str,
    source_offset: &str,
    ctx: &AdapterContext,
) -> Result<EventRecord, AdapterError> {
    let within = format!("{source_id} schedule row {row_index}");

    let title_region = find_first(row, selector!(".title"), ".title", &within)?;
    let title = first_child_text(title_region, ".title > *", &within)?;
    if title.is_empty() {
        return Err(AdapterError::Extraction {
            within,
            selector: ".title > *",
        });
    }

    let quest = find_first(row, selector!(".quest"), ".quest", &within)?;
    let mut quest_texts = quest.select(selector!(".txt")).peekable();
    if quest_texts.peek().is_none() {
        return Err(AdapterError::Extraction {
            within,
            selector: ".quest .txt",
        });
    }
    let description = collapse_whitespace(
        &quest_texts
            .flat_map(|el| el.text())
            .collect::<String>()
            .replace('\n', " "),
    );

    let level_region = find_first(row, selector!(".level"), ".level", &within)?;
    let level = format_level(&first_child_text(level_region, ".level > *", &within)?);

    let term_region = find_first(row, selector!("td.term"), "td.term", &within)?;
    let term_body = first_child_element(term_region).ok_or_else(|| AdapterError::Extraction {
        within: within.clone(),
        selector: "td.term > *",
    })?;
    let term_txt = find_first(term_body, selector!(".txt"), "td.term .txt", &within)?;
    let term = first_child_text(term_txt, "td.term .txt > *", &within)?;
    let (start, end) = normalize_term(&term, source_offset, &ctx.target_zone, ctx.today)?;

    Ok(EventRecord {
        source_id: source_id.to_string(),
        title,
        description,
        level,
        start_date: start.rendered,
        end_date: end.rendered,
        starts_at: start.instant,
        ends_at: end.instant,
        tags: classify_tags(row),
    })
}
