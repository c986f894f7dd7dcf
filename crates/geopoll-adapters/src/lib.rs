//! Catalog response shapes + the normalizer that turns raw catalog items into
//! uniform [`Record`]s.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use geopoll_core::Record;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "geopoll-adapters";

/// Upstream catalog API family. Decides the deep-link base for records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CatalogSource {
    /// ArcGIS Online `sharing/rest/search`; items link to the item-detail page.
    ArcgisSearch,
    /// ArcGIS Hub open-data `api/v2/datasets`; items link to the geoportal dataset page.
    HubDatasets,
}

impl CatalogSource {
    pub fn base_url(self) -> &'static str {
        match self {
            CatalogSource::ArcgisSearch => "https://www.arcgis.com/home/item.html?id=",
            CatalogSource::HubDatasets => "http://geoportal.statistics.gov.uk/datasets/",
        }
    }
}

/// Top-level search payload. The item list lives under `results` or, on the
/// newer endpoints, under `data`; `results` wins when both are present.
///
/// Items stay undecoded until [`CatalogResponse::into_entries`] so one
/// oddly-typed item cannot sink the rest of the listing.
#[derive(Debug, Clone, PartialEq)]
pub enum CatalogResponse {
    Results(Vec<JsonValue>),
    Data(Vec<JsonValue>),
}

/// One listing item, decoded on its own.
pub type ListingEntry = Result<RawItem, MalformedRecord>;

impl CatalogResponse {
    pub fn from_json(value: JsonValue) -> Result<Self, AdapterError> {
        let JsonValue::Object(mut body) = value else {
            return Err(AdapterError::MissingItemList);
        };
        let (key, list) = match body.remove("results") {
            Some(list) => ("results", list),
            None => ("data", body.remove("data").ok_or(AdapterError::MissingItemList)?),
        };
        let JsonValue::Array(items) = list else {
            return Err(AdapterError::NotAnArray { key });
        };
        Ok(match key {
            "results" => CatalogResponse::Results(items),
            _ => CatalogResponse::Data(items),
        })
    }

    pub fn into_entries(self) -> Vec<ListingEntry> {
        let items = match self {
            CatalogResponse::Results(items) | CatalogResponse::Data(items) => items,
        };
        items
            .into_iter()
            .enumerate()
            .map(|(position, item)| {
                serde_json::from_value::<RawItem>(item).map_err(|err| MalformedRecord::Undecodable {
                    position,
                    reason: err.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawItem {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub attributes: Option<RawAttributes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawAttributes {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Where an item keeps its human-readable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemShape<'a> {
    Flat { title: &'a str },
    Nested { title: &'a str },
}

impl ItemShape<'_> {
    pub fn title(&self) -> &str {
        match self {
            ItemShape::Flat { title } | ItemShape::Nested { title } => title,
        }
    }
}

impl RawItem {
    /// Resolves the item shape: direct `title`, then `attributes.name`, then
    /// `attributes.title`. Blank values do not count.
    pub fn shape(&self) -> Option<ItemShape<'_>> {
        if let Some(title) = non_blank(self.title.as_deref()) {
            return Some(ItemShape::Flat { title });
        }
        let attributes = self.attributes.as_ref()?;
        non_blank(attributes.name.as_deref())
            .or_else(|| non_blank(attributes.title.as_deref()))
            .map(|title| ItemShape::Nested { title })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

// Hub ids are strings, but numeric ids have been seen on older endpoints.
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("catalog response has neither a `results` nor a `data` item list")]
    MissingItemList,
    #[error("catalog response `{key}` is not an array")]
    NotAnArray { key: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("catalog item at position {position} has no id")]
    MissingId { position: usize },
    #[error("catalog item {id} has neither a title nor attributes.name/title")]
    MissingTitle { id: String },
    #[error("catalog item at position {position} could not be decoded: {reason}")]
    Undecodable { position: usize, reason: String },
}

pub fn parse_listing(value: JsonValue) -> Result<Vec<ListingEntry>, AdapterError> {
    CatalogResponse::from_json(value).map(CatalogResponse::into_entries)
}

/// Builds the uniform record for one item. The id is kept verbatim; a
/// whitespace-only id counts as missing. `position` is only used to describe
/// an item that has no id.
pub fn normalize(item: &RawItem, position: usize, base_url: &str) -> Result<Record, MalformedRecord> {
    let id = non_blank(item.id.as_deref())
        .ok_or(MalformedRecord::MissingId { position })?
        .to_string();
    let shape = item
        .shape()
        .ok_or_else(|| MalformedRecord::MissingTitle { id: id.clone() })?;
    Ok(Record {
        url: format!("{base_url}{id}"),
        title: shape.title().to_string(),
        id,
    })
}

pub fn load_catalog_fixture(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_path(source: &str, name: &str) -> PathBuf {
        workspace_root().join("fixtures").join(source).join(name)
    }

    fn decoded(value: JsonValue) -> Vec<RawItem> {
        parse_listing(value)
            .unwrap()
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn arcgis_search_fixture_normalizes_flat_items() {
        let value = load_catalog_fixture(fixture_path("arcgis-search", "onspd.json")).unwrap();
        let items = decoded(value);
        let base = CatalogSource::ArcgisSearch.base_url();
        let records = items
            .iter()
            .enumerate()
            .map(|(i, item)| normalize(item, i, base))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a8d42df48d2f4b8d9bd8bb2b3b2c4a1f");
        assert_eq!(records[0].title, "ONS Postcode Directory (February 2024)");
        assert_eq!(
            records[0].url,
            "https://www.arcgis.com/home/item.html?id=a8d42df48d2f4b8d9bd8bb2b3b2c4a1f"
        );
        assert_eq!(records[1].title, "ONS Postcode Directory (November 2023)");
    }

    #[test]
    fn hub_fixture_normalizes_nested_items() {
        let value = load_catalog_fixture(fixture_path("hub-datasets", "lgd.json")).unwrap();
        let items = decoded(value);
        assert!(matches!(items[0].shape(), Some(ItemShape::Nested { .. })));

        let record = normalize(&items[0], 0, CatalogSource::HubDatasets.base_url()).unwrap();
        assert_eq!(
            record.title,
            "Local Government Districts (December 2023) Boundaries NI BFE (Full Extent)"
        );
        assert_eq!(
            record.url,
            "http://geoportal.statistics.gov.uk/datasets/0c5c4a6e0d8b4c1f9f3d2e1a7b6c5d4e_0"
        );
    }

    #[test]
    fn results_key_takes_precedence_over_data() {
        let items = decoded(json!({
            "results": [{"id": "r1", "title": "From results"}],
            "data": [{"id": "d1", "title": "From data"}]
        }));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id.as_deref(), Some("r1"));
    }

    #[test]
    fn results_key_wins_even_when_its_items_are_bad() {
        let entries = parse_listing(json!({
            "results": [{"id": "x", "title": 1}],
            "data": [{"id": "d", "title": "D"}]
        }))
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0],
            Err(MalformedRecord::Undecodable { position: 0, .. })
        ));
    }

    #[test]
    fn oddly_typed_item_does_not_sink_its_siblings() {
        let entries = parse_listing(json!({"results": [
            {"id": "good", "title": "ONSPD Feb 2024"},
            {"id": "bad", "title": 2024},
            {"id": "worse", "attributes": "n/a"},
            "not an object",
            {"id": "also-good", "attributes": {"name": "ONSPD Nov 2023"}}
        ]}))
        .unwrap();

        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].as_ref().unwrap().id.as_deref(), Some("good"));
        for (position, entry) in entries.iter().enumerate().skip(1).take(3) {
            match entry {
                Err(MalformedRecord::Undecodable { position: p, .. }) => assert_eq!(*p, position),
                other => panic!("expected undecodable item at {position}, got {other:?}"),
            }
        }
        let last = normalize(entries[4].as_ref().unwrap(), 4, "https://x/").unwrap();
        assert_eq!(last.title, "ONSPD Nov 2023");
    }

    #[test]
    fn response_without_item_list_is_rejected() {
        let err = parse_listing(json!({"error": {"code": 400}})).unwrap_err();
        assert_eq!(err, AdapterError::MissingItemList);
        assert_eq!(parse_listing(json!([])).unwrap_err(), AdapterError::MissingItemList);
    }

    #[test]
    fn item_list_must_be_an_array() {
        let err = parse_listing(json!({"results": {"id": "x"}})).unwrap_err();
        assert_eq!(err, AdapterError::NotAnArray { key: "results" });
    }

    #[test]
    fn id_is_kept_verbatim() {
        let items = decoded(json!({"results": [{"id": " abc ", "title": "Padded"}]}));
        let record = normalize(&items[0], 0, "https://x/").unwrap();
        assert_eq!(record.id, " abc ");
        assert_eq!(record.url, "https://x/ abc ");
    }

    #[test]
    fn missing_or_blank_id_is_malformed() {
        let no_id = RawItem {
            title: Some("Orphan".into()),
            ..Default::default()
        };
        assert_eq!(
            normalize(&no_id, 3, "https://x/"),
            Err(MalformedRecord::MissingId { position: 3 })
        );

        let blank_id = RawItem {
            id: Some("  ".into()),
            title: Some("Orphan".into()),
            ..Default::default()
        };
        assert!(matches!(
            normalize(&blank_id, 0, "https://x/"),
            Err(MalformedRecord::MissingId { .. })
        ));
    }

    #[test]
    fn missing_title_everywhere_is_malformed() {
        let items = decoded(json!({"data": [{"id": "x1", "attributes": {"slug": "x"}}]}));
        assert_eq!(
            normalize(&items[0], 0, "https://x/"),
            Err(MalformedRecord::MissingTitle { id: "x1".into() })
        );
    }

    #[test]
    fn direct_title_is_used_verbatim_over_attributes() {
        let items = decoded(json!({"results": [{
            "id": "abc123",
            "title": "ONSPD_2024",
            "attributes": {"name": "ignored"}
        }]}));
        let record = normalize(&items[0], 0, "http://geoportal.statistics.gov.uk/datasets/").unwrap();
        assert_eq!(
            record,
            Record {
                id: "abc123".into(),
                title: "ONSPD_2024".into(),
                url: "http://geoportal.statistics.gov.uk/datasets/abc123".into(),
            }
        );
    }

    #[test]
    fn attributes_title_is_last_resort_and_numeric_ids_are_accepted() {
        let items = decoded(json!({"data": [{"id": 42, "attributes": {"title": "Wards"}}]}));
        let record = normalize(&items[0], 0, "https://x/").unwrap();
        assert_eq!(record.id, "42");
        assert_eq!(record.title, "Wards");
        assert_eq!(record.url, "https://x/42");
    }
}
