//! Core domain model for geopoll: normalized dataset records, the fixed set of
//! tracked categories, and the notification tasks a novel record produces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "geopoll-core";

/// Uniform dataset entry produced from one catalog item.
///
/// `id`, `title` and `url` are always populated; the normalizer refuses to
/// build a record otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub title: String,
    pub url: String,
}

impl Record {
    /// Human-readable announcement shared by chat posts and issue bodies.
    pub fn announcement(&self) -> String {
        format!("New {} available at {}", self.title, self.url)
    }
}

/// Named partition of tracked records. Each category owns one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// ONS Postcode Directory.
    Postcode,
    /// ONS UPRN (address) Directory. Stored under the legacy `onsad` table.
    Address,
    /// Local government district boundaries.
    Boundary,
    /// Ward boundaries.
    Ward,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Postcode,
        Category::Address,
        Category::Boundary,
        Category::Ward,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Category::Postcode => "onspd",
            Category::Address => "onsad",
            Category::Boundary => "lgd",
            Category::Ward => "wards",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Postcode => "postcode",
            Category::Address => "address",
            Category::Boundary => "boundary",
            Category::Ward => "ward",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown category `{0}` (expected one of postcode, address, boundary, ward)")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    /// Accepts both the category name and its table name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == needle || c.table_name() == needle)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// Outbound side effect resulting from a novel record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationTask {
    PostChatMessage {
        text: String,
    },
    RaiseTrackerIssue {
        owner: String,
        repo: String,
        title: String,
        body: String,
    },
}

impl NotificationTask {
    pub fn channel(&self) -> &'static str {
        match self {
            NotificationTask::PostChatMessage { .. } => "chat",
            NotificationTask::RaiseTrackerIssue { .. } => "tracker",
        }
    }
}
