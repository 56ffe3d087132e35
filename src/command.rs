//! Slash command payload and deploy command parsing

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use crate::{DispatchConfig, EnvironmentDescriptor, ServiceDescriptor};

/// Fields extracted from a slash command's form-encoded body.
#[derive(Clone, Default, PartialEq, Serialize)]
pub struct SlashCommand {
    #[serde(skip_serializing)]
    pub token: String,
    pub team_id: String,
    pub team_domain: String,
    pub channel_id: String,
    pub channel_name: String,
    pub user_id: String,
    pub user_name: String,
    pub command: String,
    pub text: String,
    pub response_url: Option<String>,
    pub trigger_id: String,
}

// The verification token and response_url are credentials; keep them out of logs.
impl fmt::Debug for SlashCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlashCommand")
            .field("token", &"<redacted>")
            .field("team_id", &self.team_id)
            .field("team_domain", &self.team_domain)
            .field("channel_id", &self.channel_id)
            .field("channel_name", &self.channel_name)
            .field("user_id", &self.user_id)
            .field("user_name", &self.user_name)
            .field("command", &self.command)
            .field("text", &self.text)
            .field(
                "response_url",
                &self.response_url.as_ref().map(|_| "<redacted>"),
            )
            .field("trigger_id", &self.trigger_id)
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload has no {0} field")]
    MissingField(&'static str),
}

impl SlashCommand {
    /// Parse a raw `application/x-www-form-urlencoded` body.
    pub fn from_form(body: &[u8]) -> Result<Self, PayloadError> {
        let mut fields: HashMap<String, String> = url::form_urlencoded::parse(body)
            .into_owned()
            .collect();
        let mut take = |key: &str| fields.remove(key).unwrap_or_default();

        let command = Self {
            token: take("token"),
            team_id: take("team_id"),
            team_domain: take("team_domain"),
            channel_id: take("channel_id"),
            channel_name: take("channel_name"),
            user_id: take("user_id"),
            user_name: take("user_name"),
            command: take("command"),
            text: take("text"),
            response_url: Some(take("response_url")).filter(|u| !u.trim().is_empty()),
            trigger_id: take("trigger_id"),
        };

        if command.user_id.trim().is_empty() {
            return Err(PayloadError::MissingField("user_id"));
        }
        if command.command.trim().is_empty() {
            return Err(PayloadError::MissingField("command"));
        }
        Ok(command)
    }
}

/// A resolved deploy request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployTarget {
    pub service: ServiceDescriptor,
    pub environment: EnvironmentDescriptor,
    pub branch: Option<String>,
}

impl DeployTarget {
    pub fn describe(&self) -> String {
        match &self.branch {
            Some(branch) => format!(
                "{} ({}) to {} ({})",
                self.service.name, branch, self.environment.name, self.environment.project_id
            ),
            None => format!(
                "{} to {} ({})",
                self.service.name, self.environment.name, self.environment.project_id
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandRequest {
    Help,
    Deploy(DeployTarget),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Expected `<service> <environment> [branch]`, got {0} word(s)")]
    WrongArity(usize),

    #[error("Unknown service `{0}`")]
    UnknownService(String),

    #[error("Unknown environment `{0}`")]
    UnknownEnvironment(String),

    #[error("Service `{service}` cannot be deployed to `{environment}`")]
    EnvironmentNotAllowed { service: String, environment: String },
}

/// Returns true when the text asks for usage instead of a deploy.
pub fn is_help(text: &str) -> bool {
    let text = text.trim();
    text.is_empty() || text.eq_ignore_ascii_case("help")
}

/// Splits command text into service, environment and optional branch and
/// resolves the aliases against the configured tables.
pub fn parse_request(text: &str, config: &DispatchConfig) -> Result<CommandRequest, CommandError> {
    if is_help(text) {
        return Ok(CommandRequest::Help);
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let (service_alias, env_alias, branch) = match words.as_slice() {
        [service, env] => (*service, *env, None),
        [service, env, branch] => (*service, *env, Some(branch.to_string())),
        other => return Err(CommandError::WrongArity(other.len())),
    };

    let service = config
        .find_service(service_alias)
        .ok_or_else(|| CommandError::UnknownService(service_alias.to_string()))?;
    let environment = config
        .find_environment(env_alias)
        .ok_or_else(|| CommandError::UnknownEnvironment(env_alias.to_string()))?;

    if !service.allows_environment(&environment.alias) {
        return Err(CommandError::EnvironmentNotAllowed {
            service: service.alias.clone(),
            environment: environment.alias.clone(),
        });
    }

    Ok(CommandRequest::Deploy(DeployTarget {
        service: service.clone(),
        environment: environment.clone(),
        branch,
    }))
}

/// Usage text listing what can be deployed where.
pub fn usage(command_name: &str, config: &DispatchConfig) -> String {
    let command_name = if command_name.is_empty() {
        "/deploy"
    } else {
        command_name
    };
    let mut out = format!("Usage: `{} <service> <environment> [branch]`\n", command_name);

    out.push_str("*Services:*\n");
    if config.services.is_empty() {
        out.push_str("  (none configured)\n");
    }
    for service in &config.services {
        let _ = write!(out, "  `{}` {}", service.alias, service.name);
        if let Some(envs) = &service.environments {
            let _ = write!(out, " (only {})", envs.join(", "));
        }
        out.push('\n');
    }

    out.push_str("*Environments:*\n");
    if config.environments.is_empty() {
        out.push_str("  (none configured)\n");
    }
    for env in &config.environments {
        let _ = writeln!(out, "  `{}` {}", env.alias, env.name);
    }
    out
}
