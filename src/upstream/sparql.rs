//! SPARQL queries against Wikidata and decoding of their JSON results.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const WD: &str = "http://www.wikidata.org/entity/";
pub const WDS: &str = "http://www.wikidata.org/entity/statement/";

/// "Independent politician": treated as no party/group on memberships.
pub const INDEPENDENT: &str = "Q327591";

const PREFIXES: &str = "\
PREFIX wd: <http://www.wikidata.org/entity/>
PREFIX wdt: <http://www.wikidata.org/prop/direct/>
PREFIX p: <http://www.wikidata.org/prop/>
PREFIX ps: <http://www.wikidata.org/prop/statement/>
PREFIX pq: <http://www.wikidata.org/prop/qualifier/>
PREFIX rdfs: <http://www.w3.org/2000/01/rdf-schema#>
PREFIX wikibase: <http://wikiba.se/ontology#>
PREFIX bd: <http://www.bigdata.com/rdf#>
";

/// A named query, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    /// Short name used in logs and metrics.
    pub name: String,
    pub sparql: String,
}

impl QueryDescriptor {
    pub fn new(name: &str, body: &str) -> Self {
        Self {
            name: name.to_string(),
            sparql: format!("{PREFIXES}{body}"),
        }
    }
}

impl std::fmt::Display for QueryDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

// ---------------------------------------------------------------------------
// Query builders
// ---------------------------------------------------------------------------

fn term(id: &str) -> Result<String> {
    if is_item_id(id) {
        Ok(format!("wd:{id}"))
    } else {
        Err(Error::Other(format!("not a Wikidata item id: {id:?}")))
    }
}

fn values(ids: &[String]) -> Result<String> {
    ids.iter()
        .map(String::as_str)
        .map(term)
        .collect::<Result<Vec<_>>>()
        .map(|v| v.join(" "))
}

pub fn labels(ids: &[String]) -> Result<QueryDescriptor> {
    Ok(QueryDescriptor::new(
        "labels",
        &format!(
            "SELECT ?id ?label WHERE {{\n  VALUES ?id {{ {} }}\n  ?id rdfs:label ?label .\n}}\nORDER BY ?id",
            values(ids)?
        ),
    ))
}

pub fn country_list() -> QueryDescriptor {
    QueryDescriptor::new(
        "country_list",
        "SELECT ?item ?itemLabel WHERE {
  ?item wdt:P31 wd:Q3624078 .
  FILTER NOT EXISTS { ?item wdt:P31 wd:Q3024240 }
  SERVICE wikibase:label { bd:serviceParam wikibase:language \"en\". }
}",
    )
}

pub fn legislatures(country_id: &str) -> Result<QueryDescriptor> {
    Ok(QueryDescriptor::new(
        "legislatures",
        &format!(
            "SELECT ?legislature ?legislatureLabel ?adminArea ?adminAreaLabel
       ?numberOfSeats ?numberOfDistricts ?legislaturePost ?legislaturePostLabel WHERE {{
  VALUES ?country {{ {} }}
  {{ BIND(?country AS ?adminArea) }} UNION {{ ?adminArea wdt:P17 ?country ; wdt:P31/wdt:P279* wd:Q10864048 }}
  ?adminArea wdt:P194 ?legislature .
  OPTIONAL {{ ?legislature wdt:P1342 ?numberOfSeats }}
  OPTIONAL {{ ?legislature wdt:P4253 ?numberOfDistricts }}
  OPTIONAL {{ ?legislaturePost wdt:P361 ?legislature ; wdt:P31/wdt:P279* wd:Q4164871 }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language \"en\". }}
}}",
            values(&[country_id.to_string()])?
        ),
    ))
}

/// Terms of each house, with the term-specific subclass of the house's
/// position where one exists. Takes `(house, position)` pairs.
pub fn legislature_terms(house_positions: &[(String, String)]) -> Result<QueryDescriptor> {
    let pairs = house_positions
        .iter()
        .map(|(house, position)| Ok(format!("({} {})", term(house)?, term(position)?)))
        .collect::<Result<Vec<_>>>()?
        .join(" ");
    Ok(QueryDescriptor::new(
        "legislature_terms",
        &format!(
            "SELECT ?house ?term ?termLabel ?termStart ?termEnd ?seriesOrdinal
       ?termSpecificPosition ?termSpecificPositionLabel WHERE {{
  VALUES (?house ?position) {{ {pairs} }}
  ?term p:P31 ?instance .
  ?instance ps:P31/wdt:P279* wd:Q15238777 ;
            pq:P642 ?house .
  OPTIONAL {{ ?instance pq:P1545 ?seriesOrdinal }}
  OPTIONAL {{ ?term wdt:P580 ?termStart }}
  OPTIONAL {{ ?term wdt:P582 ?termEnd }}
  OPTIONAL {{ ?termSpecificPosition wdt:P279 ?position ; wdt:P2937 ?term }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language \"en\". }}
}}
ORDER BY ?house ?termStart"
        ),
    ))
}

pub fn members(position_ids: &[String]) -> Result<QueryDescriptor> {
    Ok(QueryDescriptor::new(
        "members",
        &format!(
            "SELECT ?statement ?person ?personLabel ?role ?start ?end
       ?district ?districtLabel ?party ?partyLabel ?group ?groupLabel
       ?term ?termLabel ?endCause ?endCauseLabel
       ?subjectHasRole ?subjectHasRoleLabel WHERE {{
  VALUES ?role {{ {} }}
  ?person p:P39 ?statement .
  ?statement ps:P39 ?role .
  OPTIONAL {{ ?statement pq:P580 ?start }}
  OPTIONAL {{ ?statement pq:P582 ?end }}
  OPTIONAL {{ ?statement pq:P768 ?district }}
  OPTIONAL {{ ?statement pq:P4100 ?group }}
  OPTIONAL {{ ?statement pq:P2937 ?term }}
  OPTIONAL {{ ?statement pq:P1534 ?endCause }}
  OPTIONAL {{ ?statement pq:P2868 ?subjectHasRole }}
  OPTIONAL {{ ?person wdt:P102 ?party }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language \"en\". }}
}}
ORDER BY ?statement",
            values(position_ids)?
        ),
    ))
}

pub fn districts(house_id: &str) -> Result<QueryDescriptor> {
    Ok(QueryDescriptor::new(
        "districts",
        &format!(
            "SELECT ?constituency ?constituencyLabel ?start ?end ?geoshape WHERE {{
  VALUES ?house {{ {} }}
  ?constituency wdt:P31/wdt:P279* wd:Q192611 ;
                wdt:P194 ?house .
  OPTIONAL {{ ?constituency wdt:P571 ?start }}
  OPTIONAL {{ ?constituency wdt:P576 ?end }}
  OPTIONAL {{ ?constituency wdt:P3896 ?geoshape }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language \"en\". }}
}}",
            values(&[house_id.to_string()])?
        ),
    ))
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// SPARQL 1.1 JSON results (`SELECT` form).
#[derive(Debug, Clone, Deserialize)]
pub struct SparqlResults {
    pub results: ResultSet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultSet {
    pub bindings: Vec<Binding>,
}

/// One RDF term in a result row.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RdfTerm {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(rename = "xml:lang", default)]
    pub lang: Option<String>,
}

/// One result row, variable name → term. Unbound variables are absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Binding(pub BTreeMap<String, RdfTerm>);

impl Binding {
    pub fn get(&self, var: &str) -> Option<&RdfTerm> {
        self.0.get(var)
    }

    pub fn value(&self, var: &str) -> Option<&str> {
        self.get(var).map(|t| t.value.as_str())
    }

    pub fn require(&self, var: &str) -> Result<&RdfTerm> {
        self.get(var)
            .ok_or_else(|| Error::Payload(format!("result row missing ?{var}")))
    }

    /// Item id of a required URI variable.
    pub fn item_id(&self, var: &str) -> Result<String> {
        item_uri_to_id(&self.require(var)?.value)
    }

    /// Item id of an optional URI variable.
    pub fn opt_item_id(&self, var: &str) -> Result<Option<String>> {
        self.get(var)
            .map(|t| item_uri_to_id(&t.value))
            .transpose()
    }

    pub fn date(&self, var: &str) -> Option<String> {
        self.value(var).and_then(get_date)
    }

    pub fn int(&self, var: &str) -> Option<i64> {
        self.value(var).and_then(|v| v.parse().ok())
    }
}

pub fn is_item_id(id: &str) -> bool {
    let Some(digits) = id.strip_prefix('Q') else {
        return false;
    };
    !digits.starts_with('0') && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// `http://www.wikidata.org/entity/Q42` → `Q42`.
pub fn item_uri_to_id(uri: &str) -> Result<String> {
    match uri.strip_prefix(WD) {
        Some(id) if is_item_id(id) => Ok(id.to_string()),
        _ => Err(Error::Payload(format!("not a Wikidata item URI: {uri:?}"))),
    }
}

/// `…/statement/q42-AB-cd` → `Q42-AB-CD`.
pub fn statement_uri_to_id(uri: &str) -> Result<String> {
    let valid = |rest: &str| {
        let mut chars = rest.chars();
        matches!(chars.next(), Some('q' | 'Q'))
            && !rest[1..].is_empty()
            && rest[1..]
                .chars()
                .all(|c| c.is_ascii_hexdigit() || c == '-')
    };
    match uri.strip_prefix(WDS) {
        Some(rest) if valid(rest) => Ok(rest.to_ascii_uppercase()),
        _ => Err(Error::Payload(format!("not a Wikidata statement URI: {uri:?}"))),
    }
}

/// Leading `YYYY-MM-DD` of a date/time literal, if it has one.
pub fn get_date(value: &str) -> Option<String> {
    let date = value.get(..10)?;
    let b = date.as_bytes();
    let digits = |range: std::ops::Range<usize>| b[range].iter().all(u8::is_ascii_digit);
    let shaped = digits(0..4)
        && b[4] == b'-'
        && matches!(b[5], b'0' | b'1')
        && b[6].is_ascii_digit()
        && b[7] == b'-'
        && matches!(b[8], b'0'..=b'3')
        && b[9].is_ascii_digit();
    shaped.then(|| date.to_string())
}
