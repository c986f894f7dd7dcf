//! Notification routing and best-effort delivery to chat + issue tracker.

use async_trait::async_trait;
use geopoll_core::{Category, NotificationTask, Record};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "geopoll-notify";

pub const DEFAULT_ISSUE_OWNER: &str = "DemocracyClub";
pub const DEFAULT_MAINTAINER_HANDLE: &str = "@chris48s";
pub const DEFAULT_GITHUB_API_BASE: &str = "https://api.github.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueRoute {
    pub repo: &'static str,
    /// Only raise the issue when the record title contains this text
    /// (case-insensitive).
    pub title_contains: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryRoute {
    pub category: Category,
    pub chat: bool,
    pub issues: &'static [IssueRoute],
}

pub const ROUTING_TABLE: &[CategoryRoute] = &[
    CategoryRoute {
        category: Category::Postcode,
        chat: true,
        issues: &[
            IssueRoute {
                repo: "polling_deploy",
                title_contains: None,
            },
            IssueRoute {
                repo: "EveryElection",
                title_contains: None,
            },
        ],
    },
    CategoryRoute {
        category: Category::Address,
        chat: true,
        issues: &[IssueRoute {
            repo: "polling_deploy",
            title_contains: None,
        }],
    },
    CategoryRoute {
        category: Category::Boundary,
        chat: true,
        issues: &[IssueRoute {
            repo: "UK-Polling-Stations",
            title_contains: Some("full extent"),
        }],
    },
    CategoryRoute {
        category: Category::Ward,
        chat: true,
        issues: &[],
    },
];

pub fn route_for(category: Category) -> Option<&'static CategoryRoute> {
    ROUTING_TABLE.iter().find(|r| r.category == category)
}

impl IssueRoute {
    fn applies_to(&self, record: &Record) -> bool {
        match self.title_contains {
            Some(needle) => record
                .title
                .to_lowercase()
                .contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

/// Turns a novel record into the notification tasks its category calls for.
#[derive(Debug, Clone)]
pub struct Router {
    pub issue_owner: String,
    pub maintainer_handle: String,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            issue_owner: DEFAULT_ISSUE_OWNER.to_string(),
            maintainer_handle: DEFAULT_MAINTAINER_HANDLE.to_string(),
        }
    }
}

impl Router {
    pub fn new(issue_owner: impl Into<String>, maintainer_handle: impl Into<String>) -> Self {
        Self {
            issue_owner: issue_owner.into(),
            maintainer_handle: maintainer_handle.into(),
        }
    }

    pub fn route(&self, category: Category, record: &Record) -> Vec<NotificationTask> {
        let Some(rule) = route_for(category) else {
            return Vec::new();
        };
        let announcement = record.announcement();
        let mut tasks = Vec::new();
        if rule.chat {
            tasks.push(NotificationTask::PostChatMessage {
                text: announcement.clone(),
            });
        }
        for issue in rule.issues.iter().filter(|i| i.applies_to(record)) {
            tasks.push(NotificationTask::RaiseTrackerIssue {
                owner: self.issue_owner.clone(),
                repo: issue.repo.to_string(),
                title: format!("Import {}", record.title),
                body: format!("{} - {}", self.maintainer_handle, announcement),
            });
        }
        tasks
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{channel} rejected the request with http status {status}")]
    HttpStatus { channel: &'static str, status: u16 },
}

#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn post_message(&self, text: &str) -> Result<(), NotifyError>;
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn raise_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

/// Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackWebhook {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackWebhook {
    pub fn new(client: reqwest::Client, webhook_url: impl Into<String>) -> Self {
        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl ChatChannel for SlackWebhook {
    async fn post_message(&self, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(NotifyError::HttpStatus {
                channel: "slack",
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// GitHub REST issues API, authenticated with a token that only needs issue
/// write access.
#[derive(Debug, Clone)]
pub struct GitHubIssues {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct NewIssue<'a> {
    title: &'a str,
    body: &'a str,
}

impl GitHubIssues {
    pub fn new(client: reqwest::Client, api_base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl IssueTracker for GitHubIssues {
    async fn raise_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let url = format!("{}/repos/{owner}/{repo}/issues", self.api_base);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, "geopoll")
            .json(&NewIssue { title, body })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(NotifyError::HttpStatus {
                channel: "github",
                status: resp.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl DispatchOutcome {
    pub fn absorb(&mut self, other: DispatchOutcome) {
        self.sent += other.sent;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Delivers tasks to whichever channels are configured.
///
/// An unconfigured channel, or a disabled notifier, skips the task. A channel
/// failure is logged and counted; it never aborts the caller.
pub struct Notifier {
    enabled: bool,
    chat: Option<Box<dyn ChatChannel>>,
    tracker: Option<Box<dyn IssueTracker>>,
}

impl Notifier {
    pub fn new(
        enabled: bool,
        chat: Option<Box<dyn ChatChannel>>,
        tracker: Option<Box<dyn IssueTracker>>,
    ) -> Self {
        Self {
            enabled,
            chat,
            tracker,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None, None)
    }

    pub async fn dispatch(&self, tasks: &[NotificationTask]) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        for task in tasks {
            match self.deliver(task).await {
                Err(SkipReason::Disabled) => {
                    debug!(channel = task.channel(), "notifications disabled; skipping");
                    outcome.skipped += 1;
                }
                Err(SkipReason::Unconfigured) => {
                    debug!(channel = task.channel(), "notification channel not configured; skipping");
                    outcome.skipped += 1;
                }
                Ok(Ok(())) => {
                    info!(channel = task.channel(), "notification sent");
                    outcome.sent += 1;
                }
                Ok(Err(err)) => {
                    warn!(channel = task.channel(), error = %err, "notification failed; continuing");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn deliver(&self, task: &NotificationTask) -> Result<Result<(), NotifyError>, SkipReason> {
        if !self.enabled {
            return Err(SkipReason::Disabled);
        }
        match task {
            NotificationTask::PostChatMessage { text } => {
                let chat = self.chat.as_ref().ok_or(SkipReason::Unconfigured)?;
                Ok(chat.post_message(text).await)
            }
            NotificationTask::RaiseTrackerIssue {
                owner,
                repo,
                title,
                body,
            } => {
                let tracker = self.tracker.as_ref().ok_or(SkipReason::Unconfigured)?;
                Ok(tracker.raise_issue(owner, repo, title, body).await)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    Disabled,
    Unconfigured,
}
