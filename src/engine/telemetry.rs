use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::storage::entities::{DomainBudget, InteractionCounters, PageSession};

/// Shown when the backend cannot supply a challenge question.
pub const DEFAULT_QUESTION: &str = "You have exceeded your time limit. Continue?";

/// Failures talking to the local backend. Callers decide what to do with
/// them; the shipped policy everywhere is log-and-fall-back, never retry.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend responded with status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TabActivity {
    pub url: String,
    pub title: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub time_of_day: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub url: String,
    pub domain: String,
    pub duration: u64,
    pub interactions: InteractionCounters,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub is_distraction: bool,
    pub is_productive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Answer {
    Yes,
    No,
}

/// What the backend sends back after a challenge answer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnswerOutcome {
    pub reward_points: Option<i64>,
    pub updated_limits: Option<Vec<DomainBudget>>,
}

#[derive(Debug, Deserialize)]
struct QuestionReply {
    question: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QuestionRequest<'a> {
    domain: &'a str,
    excess_time: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerRequest<'a> {
    answer: Answer,
    domain: &'a str,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct UrlListUpload<'a> {
    urls: &'a [DomainBudget],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BehaviorUpload<'a> {
    behavior: &'a BTreeMap<String, Vec<PageSession>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    uploaded_at: DateTime<Utc>,
}

/// The outbound collaborator. Everything here is fire-and-forget JSON with
/// no retries and no request timeouts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    async fn tab_activity(&self, activity: TabActivity) -> Result<(), NetworkError>;

    async fn usage_data(&self, report: UsageReport) -> Result<(), NetworkError>;

    async fn get_question(&self, domain: String, excess_seconds: u64)
        -> Result<String, NetworkError>;

    async fn question_answer(
        &self,
        answer: Answer,
        domain: String,
        timestamp: DateTime<Utc>,
    ) -> Result<AnswerOutcome, NetworkError>;

    async fn push_distraction_urls(&self, urls: Vec<DomainBudget>) -> Result<(), NetworkError>;

    async fn push_productive_urls(&self, urls: Vec<DomainBudget>) -> Result<(), NetworkError>;

    async fn upload_behavior(
        &self,
        behavior: BTreeMap<String, Vec<PageSession>>,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), NetworkError>;
}

/// HTTP realization of [Backend] against the local collaborator.
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, NetworkError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NetworkError::Status(response.status()));
        }
        Ok(response)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn tab_activity(&self, activity: TabActivity) -> Result<(), NetworkError> {
        self.post_json("/api/tab-activity", &activity).await?;
        Ok(())
    }

    async fn usage_data(&self, report: UsageReport) -> Result<(), NetworkError> {
        self.post_json("/api/usage-data", &report).await?;
        Ok(())
    }

    async fn get_question(
        &self,
        domain: String,
        excess_seconds: u64,
    ) -> Result<String, NetworkError> {
        let response = self
            .post_json(
                "/api/get-question",
                &QuestionRequest {
                    domain: &domain,
                    excess_time: excess_seconds,
                },
            )
            .await?;
        let reply: QuestionReply = response.json().await?;
        Ok(reply.question.unwrap_or_else(|| DEFAULT_QUESTION.to_owned()))
    }

    async fn question_answer(
        &self,
        answer: Answer,
        domain: String,
        timestamp: DateTime<Utc>,
    ) -> Result<AnswerOutcome, NetworkError> {
        let response = self
            .post_json(
                "/api/question-answer",
                &AnswerRequest {
                    answer,
                    domain: &domain,
                    timestamp,
                },
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn push_distraction_urls(&self, urls: Vec<DomainBudget>) -> Result<(), NetworkError> {
        self.post_json("/api/distraction-urls", &UrlListUpload { urls: &urls })
            .await?;
        Ok(())
    }

    async fn push_productive_urls(&self, urls: Vec<DomainBudget>) -> Result<(), NetworkError> {
        self.post_json("/api/productive-urls", &UrlListUpload { urls: &urls })
            .await?;
        Ok(())
    }

    async fn upload_behavior(
        &self,
        behavior: BTreeMap<String, Vec<PageSession>>,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), NetworkError> {
        self.post_json(
            "/api/behavior-upload",
            &BehaviorUpload {
                behavior: &behavior,
                uploaded_at,
            },
        )
        .await?;
        Ok(())
    }
}
