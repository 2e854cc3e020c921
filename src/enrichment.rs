use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EnrichmentSettings;
use crate::models::Priority;

#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("enrichment is disabled")]
    Disabled,

    #[error("request to enrichment service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("enrichment service answered {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("enrichment reply was empty")]
    EmptyReply,

    #[error("unparsable enrichment reply: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("priority {0} is outside 1..=5")]
    PriorityOutOfRange(i64),
}

/// Text-generation collaborator that suggests tags and a priority.
#[async_trait]
pub trait Enricher: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn generate_tags(
        &self,
        known_tags: &[String],
        title: &str,
        description: &str,
    ) -> Result<Vec<String>, EnrichmentError>;

    async fn generate_priority(&self, title: &str, description: &str) -> Result<Priority, EnrichmentError>;
}

/// Stands in when no enrichment service is configured.
pub struct DisabledEnricher;

#[async_trait]
impl Enricher for DisabledEnricher {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn generate_tags(&self, _: &[String], _: &str, _: &str) -> Result<Vec<String>, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }

    async fn generate_priority(&self, _: &str, _: &str) -> Result<Priority, EnrichmentError> {
        Err(EnrichmentError::Disabled)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsReply {
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PriorityReply {
    priority: i64,
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct ChatEnricher {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl ChatEnricher {
    pub fn new(settings: &EnrichmentSettings) -> Result<Self, EnrichmentError> {
        let client = Client::builder().timeout(settings.timeout()).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            model: settings.model.clone(),
            api_key: settings.api_key(),
        })
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, EnrichmentError> {
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EnrichmentError::Status { status, body });
        }

        let reply: ChatResponse = response.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(EnrichmentError::EmptyReply)
    }
}

fn article_prompt(title: &str, description: &str) -> String {
    format!("Title: {}\nDescription: {}", title, description)
}

fn tags_instructions(known_tags: &[String]) -> String {
    format!(
        "You sort news articles into sections.\n\
         Give the article one to three broad tags, picked from this list: {:?}.\n\
         Only when none of them fits, invent up to three new broad tags.\n\
         Keep the article's language. Name topics, not events or people.\n\
         Answer with JSON only, shaped like {{\"tags\": [\"tag1\", \"tag2\"]}}.",
        known_tags
    )
}

const PRIORITY_INSTRUCTIONS: &str = "You rate how important a news article is for a general reader.\n\
     Use an integer from 1 (must read) to 5 (can skip).\n\
     Answer with JSON only, shaped like {\"priority\": 3}.";

#[async_trait]
impl Enricher for ChatEnricher {
    async fn generate_tags(
        &self,
        known_tags: &[String],
        title: &str,
        description: &str,
    ) -> Result<Vec<String>, EnrichmentError> {
        let reply = self
            .complete(&tags_instructions(known_tags), &article_prompt(title, description))
            .await?;
        debug!("Tag reply for {:?}: {}", title, reply);
        parse_tags(&reply)
    }

    async fn generate_priority(&self, title: &str, description: &str) -> Result<Priority, EnrichmentError> {
        let reply = self
            .complete(PRIORITY_INSTRUCTIONS, &article_prompt(title, description))
            .await?;
        debug!("Priority reply for {:?}: {}", title, reply);
        parse_priority(&reply)
    }
}

/// Cuts the JSON object out of a reply that may be wrapped in prose or a
/// code fence.
fn json_object(reply: &str) -> &str {
    match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => reply.trim(),
    }
}

pub fn parse_tags(reply: &str) -> Result<Vec<String>, EnrichmentError> {
    let parsed: TagsReply = serde_json::from_str(json_object(reply))?;
    Ok(parsed
        .tags
        .into_iter()
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect())
}

pub fn parse_priority(reply: &str) -> Result<Priority, EnrichmentError> {
    let parsed: PriorityReply = serde_json::from_str(json_object(reply))?;
    Priority::new(parsed.priority).ok_or(EnrichmentError::PriorityOutOfRange(parsed.priority))
}
