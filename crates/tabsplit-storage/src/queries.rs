//! Filtered, sorted and paginated queries.
//!
//! Queries walk a cursor over the index of the sort field, test every
//! record against all filters, skip the first `offset` matches and stop as
//! soon as `limit` matches are collected. Pages taken with consecutive
//! offsets therefore concatenate to the unpaginated result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use tabsplit_core::error::Result;
use tabsplit_core::types::{Calculation, DateRange, ReceiptImage, Template};

use crate::gateway::Gateway;
use crate::schema::{index, Document, CALCULATIONS, IMAGES, TEMPLATES};
use crate::tx::{CursorSpec, CursorStep, Direction, KeyRange, Tx};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    fn cursor(self) -> Direction {
        match self {
            SortDirection::Asc => Direction::Next,
            SortDirection::Desc => Direction::Prev,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalculationSortField {
    CreatedAt,
    UpdatedAt,
    Name,
}

impl CalculationSortField {
    fn index(self) -> &'static str {
        match self {
            CalculationSortField::CreatedAt => index::CREATED_AT,
            CalculationSortField::UpdatedAt => index::UPDATED_AT,
            CalculationSortField::Name => index::NAME,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSortField {
    Name,
    UsageCount,
    LastUsed,
    CreatedAt,
}

impl TemplateSortField {
    fn index(self) -> &'static str {
        match self {
            TemplateSortField::Name => index::NAME,
            TemplateSortField::UsageCount => index::USAGE_COUNT,
            TemplateSortField::LastUsed => index::LAST_USED,
            TemplateSortField::CreatedAt => index::CREATED_AT,
        }
    }
}

/// Filters and paging for calculation listings. The default matches every
/// calculation in primary-key order.
#[derive(Debug, Clone, Default)]
pub struct CalculationQuery {
    /// Match calculations carrying any of these tags (case-insensitive).
    pub tags: Vec<String>,
    pub starred: Option<bool>,
    /// Inclusive bounds on `createdAt`.
    pub created_range: Option<DateRange>,
    /// Case-insensitive substring of the name, description or any tag.
    pub search: Option<String>,
    pub sort: Option<(CalculationSortField, SortDirection)>,
    pub offset: usize,
    /// `None` returns every match.
    pub limit: Option<usize>,
}

impl CalculationQuery {
    pub fn matches(&self, calc: &Calculation) -> bool {
        if let Some(starred) = self.starred {
            if calc.is_starred != starred {
                return false;
            }
        }
        if let Some(range) = &self.created_range {
            if !range.contains(calc.created_at) {
                return false;
            }
        }
        any_tag_matches(&self.tags, &calc.tags)
            && search_matches(
                self.search.as_deref(),
                &calc.name,
                calc.description.as_deref(),
                &calc.tags,
            )
    }

    fn cursor_spec(&self) -> CursorSpec {
        let Some((field, direction)) = self.sort else {
            return CursorSpec::primary();
        };
        let mut spec = CursorSpec::on(field.index()).direction(direction.cursor());
        if field == CalculationSortField::CreatedAt {
            if let Some(range) = &self.created_range {
                spec = spec.range(KeyRange::between(range.from, range.to));
            }
        }
        spec
    }
}

/// Filters and paging for template listings.
#[derive(Debug, Clone, Default)]
pub struct TemplateQuery {
    pub tags: Vec<String>,
    pub search: Option<String>,
    pub sort: Option<(TemplateSortField, SortDirection)>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl TemplateQuery {
    pub fn matches(&self, template: &Template) -> bool {
        any_tag_matches(&self.tags, &template.tags)
            && search_matches(
                self.search.as_deref(),
                &template.name,
                template.description.as_deref(),
                &template.tags,
            )
    }

    fn cursor_spec(&self) -> CursorSpec {
        match self.sort {
            Some((field, direction)) => {
                CursorSpec::on(field.index()).direction(direction.cursor())
            }
            None => CursorSpec::primary(),
        }
    }
}

/// Blank entries are ignored; a filter with none left matches everything.
fn any_tag_matches(wanted: &[String], tags: &[String]) -> bool {
    let mut wanted = wanted
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .peekable();
    if wanted.peek().is_none() {
        return true;
    }
    wanted.any(|w| {
        let w = w.to_lowercase();
        tags.iter().any(|t| t.to_lowercase() == w)
    })
}

fn search_matches(
    needle: Option<&str>,
    name: &str,
    description: Option<&str>,
    tags: &[String],
) -> bool {
    let needle = match needle.map(str::trim) {
        Some(n) if !n.is_empty() => n.to_lowercase(),
        _ => return true,
    };
    name.to_lowercase().contains(&needle)
        || description.is_some_and(|d| d.to_lowercase().contains(&needle))
        || tags.iter().any(|t| t.to_lowercase().contains(&needle))
}

/// Walk `spec`, keeping records accepted by `filter`, skipping the first
/// `offset` of them and stopping once `limit` are collected.
pub(crate) fn collect_page<D, P>(
    tx: &Tx<'_>,
    spec: &CursorSpec,
    offset: usize,
    limit: Option<usize>,
    filter: P,
) -> Result<Vec<D>>
where
    D: Document,
    P: Fn(&D) -> bool,
{
    if limit == Some(0) {
        return Ok(Vec::new());
    }

    let mut skipped = 0;
    let mut page = Vec::new();
    tx.cursor(spec, |record: D| {
        if !filter(&record) {
            return Ok(CursorStep::Continue);
        }
        if skipped < offset {
            skipped += 1;
            return Ok(CursorStep::Continue);
        }
        page.push(record);
        Ok(match limit {
            Some(limit) if page.len() >= limit => CursorStep::Stop,
            _ => CursorStep::Continue,
        })
    })?;
    Ok(page)
}

pub(crate) fn query_calculations(
    tx: &Tx<'_>,
    query: &CalculationQuery,
) -> Result<Vec<Calculation>> {
    collect_page(tx, &query.cursor_spec(), query.offset, query.limit, |calc: &Calculation| {
        query.matches(calc)
    })
}

pub(crate) fn query_templates(tx: &Tx<'_>, query: &TemplateQuery) -> Result<Vec<Template>> {
    collect_page(tx, &query.cursor_spec(), query.offset, query.limit, |template: &Template| {
        query.matches(template)
    })
}

/// Totals over the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_calculations: u64,
    pub total_images: u64,
    pub total_templates: u64,
    pub starred_calculations: u64,
    /// Sum of stored image sizes in bytes.
    pub total_size: u64,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub oldest: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub newest: Option<DateTime<Utc>>,
    /// Bytes allocated by the database file.
    pub database_bytes: u64,
}

/// Cross-collection read operations.
pub struct QueryService {
    gateway: Arc<Gateway>,
}

impl QueryService {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub async fn calculations(&self, query: CalculationQuery) -> Result<Vec<Calculation>> {
        self.gateway
            .read(&[CALCULATIONS], move |tx| query_calculations(tx, &query))
            .await
    }

    pub async fn templates(&self, query: TemplateQuery) -> Result<Vec<Template>> {
        self.gateway
            .read(&[TEMPLATES], move |tx| query_templates(tx, &query))
            .await
    }

    pub async fn storage_stats(&self) -> Result<StorageStats> {
        self.gateway
            .read(&[CALCULATIONS, IMAGES, TEMPLATES], |tx| {
                let starred = tx
                    .keys::<Calculation>(
                        &CursorSpec::on(index::IS_STARRED).range(KeyRange::only(true)),
                    )?
                    .len() as u64;

                let mut total_size = 0;
                tx.cursor(&CursorSpec::primary().without_payload(), |image: ReceiptImage| {
                    total_size += image.size;
                    Ok(CursorStep::Continue)
                })?;

                Ok(StorageStats {
                    total_calculations: tx.count::<Calculation>()?,
                    total_images: tx.count::<ReceiptImage>()?,
                    total_templates: tx.count::<Template>()?,
                    starred_calculations: starred,
                    total_size,
                    oldest: first_created(tx, Direction::Next)?,
                    newest: first_created(tx, Direction::Prev)?,
                    database_bytes: tx.database_size()?,
                })
            })
            .await
    }
}

fn first_created(tx: &Tx<'_>, direction: Direction) -> Result<Option<DateTime<Utc>>> {
    let mut found = None;
    tx.cursor(
        &CursorSpec::on(index::CREATED_AT).direction(direction),
        |calc: Calculation| {
            found = Some(calc.created_at);
            Ok(CursorStep::Stop)
        },
    )?;
    Ok(found)
}
