//! Per-record refreshes of legislative structure: houses of a country,
//! members of a house, districts of a house.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use super::{RefreshOutcome, RefreshWorker, WorkerDeps, item_upsert, require_record_id};
use crate::engine::context::ExecutionContext;
use crate::error::Result;
use crate::model::record::{Record, RecordFilter, RecordKind, RecordUpsert, RecordWrite};
use crate::model::work::WorkItem;
use crate::upstream::sparql::{self, Binding, INDEPENDENT, statement_uri_to_id};
use crate::upstream::SparqlResults;

/// Field on a house listing the positions whose holders sit in it.
pub const POSITIONS_FIELD: &str = "positions";

/// Field on a house listing its terms, each with the term-specific position
/// (if any) held by members elected for that term.
pub const TERMS_FIELD: &str = "terms";

// ---------------------------------------------------------------------------
// Legislatures
// ---------------------------------------------------------------------------

/// Houses of a country and its administrative areas, plus the positions
/// held by their members.
pub struct LegislaturesWorker {
    deps: WorkerDeps,
}

impl LegislaturesWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl RefreshWorker for LegislaturesWorker {
    fn operation(&self) -> &'static str {
        "legislatures"
    }

    async fn refresh(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<RefreshOutcome> {
        let country_id = require_record_id(item)?;
        if !self.deps.still_current(item, country_id).await? {
            return Ok(RefreshOutcome::stale());
        }

        let handler = ctx.rate_limit_handler();
        let results: SparqlResults = self
            .deps
            .client
            .query(&sparql::legislatures(country_id)?, handler.as_ref())
            .await?;

        let mut writes = Vec::new();
        let mut positions: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in &results.results.bindings {
            let area = row.item_id("adminArea")?;
            if area != country_id {
                writes.push(RecordWrite::Upsert(
                    item_upsert(
                        RecordKind::AdministrativeArea,
                        &area,
                        row.value("adminAreaLabel"),
                    )
                    .parent(country_id),
                ));
            }

            let house = row.item_id("legislature")?;
            writes.push(RecordWrite::Upsert(
                item_upsert(
                    RecordKind::LegislativeHouse,
                    &house,
                    row.value("legislatureLabel"),
                )
                .parent(country_id)
                .field("administrative_area", area)
                .field("number_of_seats", row.int("numberOfSeats"))
                .field("number_of_districts", row.int("numberOfDistricts")),
            ));

            let posts = positions.entry(house).or_default();
            if let Some(post) = row.opt_item_id("legislaturePost")? {
                writes.push(RecordWrite::Upsert(item_upsert(
                    RecordKind::Position,
                    &post,
                    row.value("legislaturePostLabel"),
                )));
                posts.insert(post);
            }
        }
        let houses = positions.len();
        let house_positions: Vec<(String, String)> = positions
            .iter()
            .flat_map(|(house, posts)| posts.iter().map(|post| (house.clone(), post.clone())))
            .collect();
        for (house, posts) in positions {
            let posts: Vec<String> = posts.into_iter().collect();
            writes.push(RecordWrite::Upsert(
                RecordUpsert::new(RecordKind::LegislativeHouse, &house)
                    .field(POSITIONS_FIELD, posts),
            ));
        }

        let mut terms = 0;
        if !house_positions.is_empty() {
            if !self.deps.still_current(item, country_id).await? {
                return Ok(RefreshOutcome::stale());
            }
            let results: SparqlResults = self
                .deps
                .client
                .query(&sparql::legislature_terms(&house_positions)?, handler.as_ref())
                .await?;
            terms = term_writes(&results.results.bindings, &mut writes)?;
        }

        if !self.deps.write_fenced(item, country_id, writes).await? {
            return Ok(RefreshOutcome::stale());
        }
        info!(country = country_id, houses, terms, "legislatures refreshed");
        Ok(RefreshOutcome {
            written: 1,
            stale: 0,
        })
    }
}

/// Writes for the legislative terms of each house. Returns the number of
/// distinct terms seen.
fn term_writes(rows: &[Binding], writes: &mut Vec<RecordWrite>) -> Result<usize> {
    let mut houses: BTreeMap<String, BTreeMap<String, Option<String>>> = BTreeMap::new();
    let mut seen = BTreeSet::new();
    for row in rows {
        let house = row.item_id("house")?;
        let term = row.item_id("term")?;

        let specific = row.opt_item_id("termSpecificPosition")?;
        if let Some(position) = &specific {
            writes.push(RecordWrite::Upsert(item_upsert(
                RecordKind::Position,
                position,
                row.value("termSpecificPositionLabel"),
            )));
        }

        if seen.insert(term.clone()) {
            writes.push(RecordWrite::Upsert(
                item_upsert(RecordKind::LegislativeTerm, &term, row.value("termLabel"))
                    .parent(&house)
                    .field("start", row.date("termStart"))
                    .field("end", row.date("termEnd"))
                    .field("series_ordinal", row.int("seriesOrdinal")),
            ));
        }

        let slot = houses.entry(house).or_default().entry(term).or_default();
        if specific.is_some() {
            *slot = specific;
        }
    }

    for (house, terms) in houses {
        let terms: Vec<Value> = terms
            .into_iter()
            .map(|(term, position)| json!({"term": term, "term_specific_position": position}))
            .collect();
        writes.push(RecordWrite::Upsert(
            RecordUpsert::new(RecordKind::LegislativeHouse, &house).field(TERMS_FIELD, terms),
        ));
    }
    Ok(seen.len())
}

// ---------------------------------------------------------------------------
// Members
// ---------------------------------------------------------------------------

/// Memberships of one house, one per position-held statement.
pub struct MembersWorker {
    deps: WorkerDeps,
}

impl MembersWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl RefreshWorker for MembersWorker {
    fn operation(&self) -> &'static str {
        "members"
    }

    async fn refresh(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<RefreshOutcome> {
        let house_id = require_record_id(item)?;
        if !self.deps.still_current(item, house_id).await? {
            return Ok(RefreshOutcome::stale());
        }

        let house = self.deps.store.get(item.kind, house_id).await?;
        let positions: Vec<String> = house
            .data
            .get(POSITIONS_FIELD)
            .and_then(Value::as_array)
            .map(|posts| {
                posts
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        // A house with no known positions has no members.
        let rows = if positions.is_empty() {
            Vec::new()
        } else {
            let handler = ctx.rate_limit_handler();
            let results: SparqlResults = self
                .deps
                .client
                .query(&sparql::members(&positions)?, handler.as_ref())
                .await?;
            results.results.bindings
        };

        let mut statements: BTreeMap<String, Vec<&Binding>> = BTreeMap::new();
        for row in &rows {
            let statement = statement_uri_to_id(&row.require("statement")?.value)?;
            statements.entry(statement).or_default().push(row);
        }

        let mut term_ids = BTreeSet::new();
        for row in &rows {
            if let Some(term) = row.opt_item_id("term")? {
                term_ids.insert(term);
            }
        }
        let term_dates = if term_ids.is_empty() {
            BTreeMap::new()
        } else {
            let terms = self
                .deps
                .store
                .select(
                    RecordKind::LegislativeTerm,
                    &RecordFilter::ids(term_ids.into_iter().collect()),
                )
                .await?;
            term_dates(&terms)
        };

        let mut writes = Vec::new();
        for (statement, rows) in &statements {
            membership_writes(house_id, statement, rows, &term_dates, &mut writes)?;
        }
        writes.push(RecordWrite::Prune {
            kind: RecordKind::Membership,
            parent_id: Some(house_id.to_string()),
            keep: statements.keys().cloned().collect(),
        });

        if !self.deps.write_fenced(item, house_id, writes).await? {
            return Ok(RefreshOutcome::stale());
        }
        info!(house = house_id, memberships = statements.len(), "members refreshed");
        Ok(RefreshOutcome {
            written: 1,
            stale: 0,
        })
    }
}

/// Known dates of a legislative term.
#[derive(Debug, Default)]
struct TermDates {
    start: Option<String>,
    end: Option<String>,
}

fn term_dates(terms: &[Record]) -> BTreeMap<String, TermDates> {
    let date = |term: &Record, field: &str| {
        term.data
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    terms
        .iter()
        .map(|term| {
            let dates = TermDates {
                start: date(term, "start"),
                end: date(term, "end"),
            };
            (term.id.clone(), dates)
        })
        .collect()
}

fn earliest<'a>(dates: impl Iterator<Item = Option<&'a String>>) -> Option<String> {
    dates.flatten().min().cloned()
}

/// Writes for one statement. Rows of the same statement differ only in
/// their multi-valued qualifiers (terms, parties). A membership without its
/// own start or end takes the earliest one among its terms.
fn membership_writes(
    house_id: &str,
    statement: &str,
    rows: &[&Binding],
    term_dates: &BTreeMap<String, TermDates>,
    writes: &mut Vec<RecordWrite>,
) -> Result<()> {
    let Some(first) = rows.first() else {
        return Ok(());
    };

    let person = first.item_id("person")?;
    writes.push(RecordWrite::Upsert(item_upsert(
        RecordKind::Person,
        &person,
        first.value("personLabel"),
    )));
    let role = first.item_id("role")?;

    let district = first.opt_item_id("district")?;
    if let Some(district) = &district {
        writes.push(RecordWrite::Upsert(
            item_upsert(
                RecordKind::ElectoralDistrict,
                district,
                first.value("districtLabel"),
            )
            .parent(house_id),
        ));
    }

    let end_cause = first.opt_item_id("endCause")?;
    if let Some(end_cause) = &end_cause {
        writes.push(RecordWrite::Upsert(item_upsert(
            RecordKind::Term,
            end_cause,
            first.value("endCauseLabel"),
        )));
    }

    let subject_has_role = first.opt_item_id("subjectHasRole")?;
    if let Some(role) = &subject_has_role {
        writes.push(RecordWrite::Upsert(item_upsert(
            RecordKind::Term,
            role,
            first.value("subjectHasRoleLabel"),
        )));
    }

    let mut terms = BTreeSet::new();
    for row in rows {
        if let Some(term) = row.opt_item_id("term")? {
            if terms.insert(term.clone()) {
                writes.push(RecordWrite::Upsert(
                    item_upsert(RecordKind::LegislativeTerm, &term, row.value("termLabel"))
                        .parent(house_id),
                ));
            }
        }
    }

    // "Independent" is a flag on the membership, not an organization.
    let mut independent = false;
    let mut organization = |var: &str, label: &str| -> Result<Option<String>> {
        match first.opt_item_id(var)? {
            Some(id) if id == INDEPENDENT => {
                independent = true;
                Ok(None)
            }
            Some(id) => {
                writes.push(RecordWrite::Upsert(item_upsert(
                    RecordKind::Organization,
                    &id,
                    first.value(label),
                )));
                Ok(Some(id))
            }
            None => Ok(None),
        }
    };
    let group = organization("group", "groupLabel")?;
    let party = organization("party", "partyLabel")?.or_else(|| group.clone());

    let known: Vec<&TermDates> = terms.iter().filter_map(|t| term_dates.get(t)).collect();
    let start = first
        .date("start")
        .or_else(|| earliest(known.iter().map(|d| d.start.as_ref())));
    let end = first
        .date("end")
        .or_else(|| earliest(known.iter().map(|d| d.end.as_ref())));

    writes.push(RecordWrite::Upsert(
        RecordUpsert::new(RecordKind::Membership, statement)
            .parent(house_id)
            .field("person", person)
            .field("position", role)
            .field("district", district)
            .field("party", party)
            .field("parliamentary_group", group)
            .field("independent", independent)
            .field("start", start)
            .field("end", end)
            .field("end_cause", end_cause)
            .field("subject_has_role", subject_has_role)
            .field("legislative_terms", terms.into_iter().collect::<Vec<_>>()),
    ));
    Ok(())
}

// ---------------------------------------------------------------------------
// Districts
// ---------------------------------------------------------------------------

/// Electoral districts of one house.
pub struct DistrictsWorker {
    deps: WorkerDeps,
}

impl DistrictsWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl RefreshWorker for DistrictsWorker {
    fn operation(&self) -> &'static str {
        "districts"
    }

    async fn refresh(&self, item: &WorkItem, ctx: &ExecutionContext) -> Result<RefreshOutcome> {
        let house_id = require_record_id(item)?;
        if !self.deps.still_current(item, house_id).await? {
            return Ok(RefreshOutcome::stale());
        }

        let handler = ctx.rate_limit_handler();
        let results: SparqlResults = self
            .deps
            .client
            .query(&sparql::districts(house_id)?, handler.as_ref())
            .await?;

        let mut writes = Vec::with_capacity(results.results.bindings.len());
        for row in &results.results.bindings {
            let district = row.item_id("constituency")?;
            writes.push(RecordWrite::Upsert(
                item_upsert(
                    RecordKind::ElectoralDistrict,
                    &district,
                    row.value("constituencyLabel"),
                )
                .parent(house_id)
                .field("start", row.date("start"))
                .field("end", row.date("end"))
                .field("geoshape_url", row.value("geoshape").map(str::to_string)),
            ));
        }
        let districts = writes.len();

        if !self.deps.write_fenced(item, house_id, writes).await? {
            return Ok(RefreshOutcome::stale());
        }
        info!(house = house_id, districts, "districts refreshed");
        Ok(RefreshOutcome {
            written: 1,
            stale: 0,
        })
    }
}
