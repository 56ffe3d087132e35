//! Replies to the chat platform, inline or through the response_url

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

use crate::auth::AuthError;
use crate::cloudbuild::{BuildFailure, BuildOutcome};
use crate::command::{CommandError, DeployTarget};
use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Only visible to the user who invoked the command.
    #[default]
    Ephemeral,
    /// Visible to everyone in the channel.
    InChannel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlashReply {
    pub response_type: ResponseType,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_original: Option<bool>,
}

impl SlashReply {
    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Ephemeral,
            text: text.into(),
            replace_original: None,
        }
    }

    pub fn in_channel(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::InChannel,
            text: text.into(),
            replace_original: None,
        }
    }

    /// Marks a deferred reply as a replacement for the acknowledgment.
    pub fn replacing_original(mut self) -> Self {
        self.replace_original = Some(true);
        self
    }
}

pub fn usage_reply(usage: String) -> SlashReply {
    SlashReply::ephemeral(usage)
}

pub fn rate_limited_reply(window_secs: u64) -> SlashReply {
    SlashReply::ephemeral(format!(
        ":hourglass: Too many deploy commands. Try again in {} seconds.",
        window_secs
    ))
}

pub fn denied_reply(reason: &AuthError) -> SlashReply {
    match reason {
        AuthError::UserNotAllowed { .. } => {
            SlashReply::ephemeral(":no_entry: You are not allowed to trigger deployments.")
        }
        AuthError::TeamNotAllowed { .. } => {
            SlashReply::ephemeral(":no_entry: This workspace is not allowed to trigger deployments.")
        }
    }
}

pub fn command_error_reply(err: &CommandError, usage: &str) -> SlashReply {
    SlashReply::ephemeral(format!(":warning: {}\n{}", err, usage))
}

pub fn acknowledgment_reply(target: &DeployTarget) -> SlashReply {
    SlashReply::ephemeral(format!(":hourglass_flowing_sand: Triggering {}...", target.describe()))
}

/// Final message for a build outcome.
pub fn outcome_reply(user_name: &str, target: &DeployTarget, outcome: &BuildOutcome) -> SlashReply {
    match outcome {
        BuildOutcome::Triggered(build) => {
            let mut text = format!(
                ":rocket: {} triggered a deploy of {}. Build `{}`",
                display_user(user_name),
                target.describe(),
                build.build_id
            );
            if let Some(log_url) = &build.log_url {
                text.push_str(&format!(" (<{}|logs>)", log_url));
            }
            SlashReply::in_channel(text)
        }
        BuildOutcome::Failed(failure) => SlashReply::ephemeral(format!(
            ":x: Could not trigger {}: {}",
            target.describe(),
            failure_hint(failure)
        )),
    }
}

fn display_user(user_name: &str) -> String {
    if user_name.is_empty() {
        "Someone".to_string()
    } else {
        format!("@{}", user_name)
    }
}

fn failure_hint(failure: &BuildFailure) -> String {
    match failure {
        BuildFailure::NotFound(_) => {
            "the build trigger does not exist in that project. Check the service configuration."
                .to_string()
        }
        BuildFailure::PermissionDenied(_) | BuildFailure::Unauthenticated(_) => {
            "the deploy bot lacks permission to run this trigger.".to_string()
        }
        other => other.to_string(),
    }
}

/// Posts deferred replies to Slack response URLs.
#[derive(Clone)]
pub struct ReplySender {
    http: reqwest::Client,
}

impl ReplySender {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::new(http))
    }

    pub async fn send(&self, response_url: &str, reply: &SlashReply) -> Result<(), DispatchError> {
        debug!("Sending delayed response to: {}", response_url);

        let resp = self
            .http
            .post(response_url)
            .json(reply)
            .send()
            .await
            .map_err(|e| DispatchError::ReplyFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!("Failed to send delayed response: {} - {}", status, body);
            return Err(DispatchError::ReplyFailed(format!("{} - {}", status, body)));
        }

        debug!("Delayed response sent successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudbuild::TriggeredBuild;
    use crate::{EnvironmentDescriptor, ServiceDescriptor};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target() -> DeployTarget {
        DeployTarget {
            service: ServiceDescriptor {
                alias: "api".to_string(),
                name: "API server".to_string(),
                trigger_id: "deploy-api".to_string(),
                environments: None,
            },
            environment: EnvironmentDescriptor {
                alias: "prod".to_string(),
                name: "Production".to_string(),
                project_id: "acme-prod".to_string(),
            },
            branch: None,
        }
    }

    #[test]
    fn serializes_slack_shape() {
        let reply = SlashReply::in_channel("hi").replacing_original();
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"response_type": "in_channel", "text": "hi", "replace_original": true})
        );
        assert_eq!(
            serde_json::to_value(SlashReply::ephemeral("x")).unwrap(),
            json!({"response_type": "ephemeral", "text": "x"})
        );
    }

    #[test]
    fn success_is_posted_in_channel_with_logs() {
        let outcome = BuildOutcome::Triggered(TriggeredBuild {
            build_id: "b-1".to_string(),
            log_url: Some("https://logs/b-1".to_string()),
            status: Some("QUEUED".to_string()),
        });
        let reply = outcome_reply("ana", &target(), &outcome);
        assert_eq!(reply.response_type, ResponseType::InChannel);
        assert!(reply.text.contains("@ana"));
        assert!(reply.text.contains("`b-1`"));
        assert!(reply.text.contains("<https://logs/b-1|logs>"));
    }

    #[test]
    fn failure_is_ephemeral() {
        let outcome = BuildOutcome::Failed(BuildFailure::NotFound("x".to_string()));
        let reply = outcome_reply("", &target(), &outcome);
        assert_eq!(reply.response_type, ResponseType::Ephemeral);
        assert!(reply.text.contains("does not exist"));

        let outcome = BuildOutcome::Failed(BuildFailure::Transport("timed out".to_string()));
        assert!(outcome_reply("", &target(), &outcome).text.contains("timed out"));
    }

    #[tokio::test]
    async fn posts_to_response_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/commands/1"))
            .and(body_json(json!({"response_type": "ephemeral", "text": "done"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sender = ReplySender::new(reqwest::Client::new());
        sender
            .send(&format!("{}/commands/1", server.uri()), &SlashReply::ephemeral("done"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("expired_url"))
            .mount(&server)
            .await;

        let sender = ReplySender::new(reqwest::Client::new());
        let err = sender
            .send(&server.uri(), &SlashReply::ephemeral("late"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired_url"));
    }
}
