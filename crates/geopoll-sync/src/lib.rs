//! Poll orchestration: fetch each configured catalog, detect unseen datasets,
//! notify, and persist.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use geopoll_adapters::{normalize, parse_listing, CatalogSource};
use geopoll_core::{Category, Record};
use geopoll_notify::{
    ChatChannel, DispatchOutcome, GitHubIssues, IssueTracker, Notifier, Router, SlackWebhook,
    DEFAULT_GITHUB_API_BASE, DEFAULT_ISSUE_OWNER, DEFAULT_MAINTAINER_HANDLE,
};
use geopoll_storage::{
    CatalogFetcher, HttpClientConfig, HttpFetcher, RecordStore, SqliteRecordStore, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "geopoll-sync";

const ARCGIS_SEARCH_ENDPOINT: &str = "http://ons.maps.arcgis.com/sharing/rest/search";
const HUB_DATASETS_ENDPOINT: &str = "https://opendata.arcgis.com/api/v2/datasets";
const ONS_ORG_ID: &str = "ESMARspQHYMw9BZ9";
const ONS_HUB_CATALOG: &str = "geoportal1-ons.opendata.arcgis.com";

// Item types that share the directory tags but are never the CSV release.
const EXCLUDED_ITEM_TYPES: &[&str] = &[
    "Layer",
    "Map Document",
    "Map Package",
    "Basemap Package",
    "Mobile Basemap Package",
    "Mobile Map Package",
    "ArcPad Package",
    "Project Package",
    "Project Template",
    "Desktop Style",
    "Pro Map",
    "Layout",
    "Explorer Map",
    "Globe Document",
    "Scene Document",
    "Published Map",
    "Map Template",
    "Windows Mobile Package",
    "Layer Package",
    "Explorer Layer",
    "Geoprocessing Package",
    "Desktop Application Template",
    "Code Sample",
    "Geoprocessing Sample",
    "Locator Package",
    "Workflow Manager Package",
    "Explorer Add In",
    "Desktop Add In",
    "File Geodatabase",
    "Feature Collection Template",
    "Code Attachment",
    "Featured Items",
    "Symbol Set",
    "Color Set",
    "Windows Viewer Add In",
    "Windows Viewer Configuration",
];

#[derive(Clone)]
pub struct PollConfig {
    pub database_url: String,
    pub chat_webhook_url: Option<String>,
    pub github_api_key: Option<String>,
    pub send_notifications: bool,
    pub targets_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub schedule_cron: String,
    pub issue_owner: String,
    pub maintainer_handle: String,
    pub github_api_base: String,
}

impl PollConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| "sqlite://data.sqlite".to_string()),
            chat_webhook_url: get("MORPH_POLLING_BOT_SLACK_WEBHOOK_URL"),
            github_api_key: get("MORPH_GITHUB_ISSUE_ONLY_API_KEY"),
            send_notifications: get("GEOPOLL_SEND_NOTIFICATIONS")
                .map(|v| {
                    let v = v.trim().to_ascii_lowercase();
                    !matches!(v.as_str(), "0" | "false" | "no" | "off")
                })
                .unwrap_or(true),
            targets_file: get("GEOPOLL_TARGETS_FILE").map(PathBuf::from),
            user_agent: get("GEOPOLL_USER_AGENT").unwrap_or_else(|| "geopoll-bot/0.1".to_string()),
            http_timeout_secs: get("GEOPOLL_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            schedule_cron: get("GEOPOLL_SCHEDULE_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            issue_owner: get("GEOPOLL_GITHUB_OWNER").unwrap_or_else(|| DEFAULT_ISSUE_OWNER.to_string()),
            maintainer_handle: get("GEOPOLL_MAINTAINER_HANDLE")
                .unwrap_or_else(|| DEFAULT_MAINTAINER_HANDLE.to_string()),
            github_api_base: get("GEOPOLL_GITHUB_API_BASE")
                .unwrap_or_else(|| DEFAULT_GITHUB_API_BASE.to_string()),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl fmt::Debug for PollConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("PollConfig")
            .field("database_url", &self.database_url)
            .field("chat_webhook_url", &redact(&self.chat_webhook_url))
            .field("github_api_key", &redact(&self.github_api_key))
            .field("send_notifications", &self.send_notifications)
            .field("targets_file", &self.targets_file)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("schedule_cron", &self.schedule_cron)
            .field("issue_owner", &self.issue_owner)
            .field("maintainer_handle", &self.maintainer_handle)
            .field("github_api_base", &self.github_api_base)
            .finish()
    }
}

/// One catalog search to poll and the category its results belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub category: Category,
    pub source: CatalogSource,
    pub url: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Target {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.source.base_url())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TargetRegistry {
    pub targets: Vec<Target>,
}

impl TargetRegistry {
    /// The ONS postcode, UPRN, LGD and ward searches, in poll order.
    pub fn builtin() -> Result<Self> {
        Ok(Self {
            targets: vec![
                Target {
                    category: Category::Postcode,
                    source: CatalogSource::ArcgisSearch,
                    url: arcgis_csv_search_url("ONS Postcode Directory")?,
                    base_url: None,
                },
                Target {
                    category: Category::Address,
                    source: CatalogSource::ArcgisSearch,
                    url: arcgis_csv_search_url("ONS UPRN Directory")?,
                    base_url: None,
                },
                Target {
                    category: Category::Boundary,
                    source: CatalogSource::HubDatasets,
                    url: hub_datasets_url("LGD Boundaries")?,
                    base_url: None,
                },
                Target {
                    category: Category::Ward,
                    source: CatalogSource::HubDatasets,
                    url: hub_datasets_url("WD_NC")?,
                    base_url: None,
                },
            ],
        })
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn load(targets_file: Option<&Path>) -> Result<Self> {
        match targets_file {
            Some(path) => Self::from_yaml_file(path),
            None => Self::builtin(),
        }
    }
}

fn arcgis_csv_search_url(tag: &str) -> Result<String> {
    let mut query = format!("(tags:{tag} type:CSV orgid:{ONS_ORG_ID})");
    for item_type in EXCLUDED_ITEM_TYPES {
        query.push_str(&format!(" -type:\"{item_type}\""));
    }
    let url = Url::parse_with_params(
        ARCGIS_SEARCH_ENDPOINT,
        &[
            ("q", query.as_str()),
            ("sortField", "modified"),
            ("sortOrder", "desc"),
            ("num", "10"),
            ("f", "json"),
        ],
    )
    .context("building ArcGIS search url")?;
    Ok(url.into())
}

fn hub_datasets_url(query: &str) -> Result<String> {
    let url = Url::parse_with_params(
        HUB_DATASETS_ENDPOINT,
        &[
            ("filter[catalogs]", ONS_HUB_CATALOG),
            ("include", "organizations,groups"),
            ("page[number]", "1"),
            ("page[size]", "10"),
            ("q", query),
            ("sort", "-updatedAt"),
        ],
    )
    .context("building Hub datasets url")?;
    Ok(url.into())
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub category: Category,
    pub url: String,
    pub items: usize,
    pub novel: usize,
    pub persisted: usize,
    pub malformed_skipped: usize,
    pub notifications: DispatchOutcome,
}

impl TargetSummary {
    fn new(target: &Target) -> Self {
        Self {
            category: target.category,
            url: target.url.clone(),
            items: 0,
            novel: 0,
            persisted: 0,
            malformed_skipped: 0,
            notifications: DispatchOutcome::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PollRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetSummary>,
}

impl PollRunSummary {
    pub fn total_items(&self) -> usize {
        self.targets.iter().map(|t| t.items).sum()
    }

    pub fn total_novel(&self) -> usize {
        self.targets.iter().map(|t| t.novel).sum()
    }

    pub fn notifications(&self) -> DispatchOutcome {
        let mut total = DispatchOutcome::default();
        for target in &self.targets {
            total.absorb(target.notifications);
        }
        total
    }
}

/// Novelty check against the category's persisted ids. A category whose table
/// has never been created has seen nothing, so every record is new.
pub async fn is_new(
    store: &dyn RecordStore,
    category: Category,
    record: &Record,
) -> Result<bool, StoreError> {
    match store.find(category, &record.id).await {
        Ok(existing) => Ok(existing.is_none()),
        Err(StoreError::MissingTable { .. }) => Ok(true),
        Err(err) => Err(err),
    }
}

pub struct Dispatcher {
    fetcher: Box<dyn CatalogFetcher>,
    store: Box<dyn RecordStore>,
    router: Router,
    notifier: Notifier,
    targets: Vec<Target>,
    run_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        fetcher: Box<dyn CatalogFetcher>,
        store: Box<dyn RecordStore>,
        router: Router,
        notifier: Notifier,
        targets: Vec<Target>,
    ) -> Self {
        Self {
            fetcher,
            store,
            router,
            notifier,
            targets,
            run_lock: Mutex::new(()),
        }
    }

    pub async fn from_config(config: &PollConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let client = http.client().clone();

        let chat = config
            .chat_webhook_url
            .as_ref()
            .map(|url| Box::new(SlackWebhook::new(client.clone(), url)) as Box<dyn ChatChannel>);
        let tracker = config.github_api_key.as_ref().map(|key| {
            Box::new(GitHubIssues::new(client.clone(), &config.github_api_base, key))
                as Box<dyn IssueTracker>
        });
        let notifier = Notifier::new(config.send_notifications, chat, tracker);
        let router = Router::new(&config.issue_owner, &config.maintainer_handle);

        let store = SqliteRecordStore::connect(&config.database_url).await?;
        let registry = TargetRegistry::load(config.targets_file.as_deref())?;

        Ok(Self::new(
            Box::new(http),
            Box::new(store),
            router,
            notifier,
            registry.targets,
        ))
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Creates every category table up front.
    pub async fn init_schema(&self) -> Result<()> {
        for category in Category::ALL {
            self.store
                .ensure_table(category)
                .await
                .with_context(|| format!("creating table {}", category.table_name()))?;
        }
        Ok(())
    }

    /// Polls every target in order. The first fetch or storage failure aborts
    /// the run; records committed before it stay committed.
    pub async fn run_once(&self) -> Result<PollRunSummary> {
        let _running = self.run_lock.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let mut targets = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            let span = info_span!("poll_target", %run_id, category = %target.category);
            let summary = self.poll_target(target).instrument(span).await?;
            targets.push(summary);
        }

        let summary = PollRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            targets,
        };
        info!(
            %run_id,
            items = summary.total_items(),
            novel = summary.total_novel(),
            "poll run complete"
        );
        Ok(summary)
    }

    async fn poll_target(&self, target: &Target) -> Result<TargetSummary> {
        let mut summary = TargetSummary::new(target);
        let category = target.category;

        let body = self
            .fetcher
            .fetch_json(&target.url)
            .await
            .with_context(|| format!("fetching {category} catalog {}", target.url))?;
        let entries = parse_listing(body)
            .with_context(|| format!("reading {category} catalog response"))?;
        summary.items = entries.len();

        for (position, entry) in entries.into_iter().enumerate() {
            let normalized = entry.and_then(|item| normalize(&item, position, target.base_url()));
            let record = match normalized {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping malformed catalog item");
                    summary.malformed_skipped += 1;
                    continue;
                }
            };

            let novel = is_new(self.store.as_ref(), category, &record)
                .await
                .with_context(|| format!("looking up {} in {}", record.id, category.table_name()))?;
            if novel {
                info!(id = %record.id, title = %record.title, url = %record.url, "new dataset");
                summary.novel += 1;
                let tasks = self.router.route(category, &record);
                summary.notifications.absorb(self.notifier.dispatch(&tasks).await);
            }

            self.store
                .upsert(category, &record)
                .await
                .with_context(|| format!("saving {} to {}", record.id, category.table_name()))?;
            self.store
                .commit()
                .await
                .with_context(|| format!("committing {} to {}", record.id, category.table_name()))?;
            summary.persisted += 1;
        }

        Ok(summary)
    }
}

pub async fn run_poll_once_from_env() -> Result<PollRunSummary> {
    let config = PollConfig::from_env();
    let dispatcher = Dispatcher::from_config(&config).await?;
    dispatcher.run_once().await
}

pub async fn build_scheduler(dispatcher: Arc<Dispatcher>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            match dispatcher.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    novel = summary.total_novel(),
                    "scheduled poll finished"
                ),
                Err(err) => error!(error = ?err, "scheduled poll failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Polls on `GEOPOLL_SCHEDULE_CRON` until Ctrl-C.
pub async fn run_scheduled_from_env() -> Result<()> {
    let config = PollConfig::from_env();
    let dispatcher = Arc::new(Dispatcher::from_config(&config).await?);
    let mut sched = build_scheduler(dispatcher, &config.schedule_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.schedule_cron, "scheduler started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
