use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::time::Duration;

const SKILL_EXECUTE_PATH: &str = "/api/v1/skill/execute";
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Runs one skill against the LLM backend and returns its raw text
#[async_trait]
pub trait SkillExecutor: Send + Sync {
    async fn execute_skill(
        &self,
        system_prompt: &str,
        message: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>>;
}

#[derive(Debug, Serialize)]
struct SkillContext {
    #[serde(rename = "type")]
    context_type: &'static str,
    selected_text: Option<String>,
}

#[derive(Debug, Serialize)]
struct SkillExecuteRequest<'a> {
    system_prompt: &'a str,
    message: &'a str,
    context: SkillContext,
}

#[derive(Debug, Deserialize)]
struct SkillExecuteResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| body.chars().take(200).collect());
    format!("Skill API error ({}): {}", status, detail)
}

/// `SkillExecutor` backed by the GHOSTYPE skill endpoint
pub struct HttpSkillExecutor {
    client: Client,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpSkillExecutor {
    pub fn new(
        api_base_url: &str,
        api_token: Option<String>,
        timeout_secs: u64,
    ) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", api_base_url.trim_end_matches('/'), SKILL_EXECUTE_PATH),
            api_token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SkillExecutor for HttpSkillExecutor {
    async fn execute_skill(
        &self,
        system_prompt: &str,
        message: &str,
    ) -> Result<String, Box<dyn Error + Send + Sync>> {
        let request = SkillExecuteRequest {
            system_prompt,
            message,
            context: SkillContext {
                context_type: "no_input",
                selected_text: None,
            },
        };

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(token) = &self.api_token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 401 {
                return Err("Unauthorized - sign in again".into());
            } else if status.as_u16() == 429 {
                return Err("Rate limited - too many requests".into());
            }
            return Err(error_message(status, &error_text).into());
        }

        let body: SkillExecuteResponse = response.json().await?;
        Ok(body.text)
    }
}
