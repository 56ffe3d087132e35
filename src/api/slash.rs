//! Slash command endpoint
//!
//! verify signature → authorize → parse → trigger build → audit → reply

use axum::{
    Json,
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::audit::AuditRecord;
use crate::auth::Authorizer;
use crate::command::{CommandRequest, DeployTarget, SlashCommand, parse_request, usage};
use crate::reply::{
    ResponseType, SlashReply, acknowledgment_reply, command_error_reply, denied_reply,
    outcome_reply, rate_limited_reply, usage_reply,
};
use crate::signature::{SIGNATURE_HEADER, TIMESTAMP_HEADER, verify_slack_signature};
use crate::{AppState, ReplyMode, SharedState};

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handles the Slack slash command POST request.
pub async fn handle_slash_command(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = state.config_snapshot();

    if let Err(e) = verify_slack_signature(
        &state.signing_secret,
        header_str(&headers, TIMESTAMP_HEADER),
        &body,
        header_str(&headers, SIGNATURE_HEADER),
        Utc::now().timestamp(),
        config.server.get_signature_tolerance(),
    ) {
        warn!("Rejected slash command: {}", e);
        return (StatusCode::UNAUTHORIZED, "invalid request signature").into_response();
    }

    let command = match SlashCommand::from_form(&body) {
        Ok(command) => command,
        Err(e) => {
            info!("Could not parse slash command payload: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    debug!("{:#?}", &command);

    // Help is answered before authorization and never audited
    let parsed = match parse_request(&command.text, &config) {
        Ok(CommandRequest::Help) => {
            return Json(usage_reply(usage(&command.command, &config))).into_response();
        }
        Ok(CommandRequest::Deploy(target)) => Ok(target),
        Err(e) => Err(e),
    };

    {
        let mut limiter = state.rate_limiter.lock().await;
        if limiter.check_rate_limit(
            &command.user_id,
            config.server.get_rate_limit(),
            config.server.get_rate_limit_window(),
        ) {
            warn!(
                "Too many commands from user {} - {} per {} seconds",
                command.user_id,
                config.server.get_rate_limit(),
                config.server.get_rate_limit_window()
            );
            return Json(rate_limited_reply(config.server.get_rate_limit_window())).into_response();
        }
    }

    // Every path from here on writes exactly one audit record
    if let Err(reason) = Authorizer::new(&config.auth).check(&command) {
        warn!(
            "Denied '{}' from {} ({}): {}",
            command.text, command.user_name, command.user_id, reason
        );
        write_audit(&state, AuditRecord::denied(&command, &reason)).await;
        return Json(denied_reply(&reason)).into_response();
    }

    let target = match parsed {
        Ok(target) => target,
        Err(e) => {
            info!("Invalid command '{}' from {}: {}", command.text, command.user_id, e);
            write_audit(&state, AuditRecord::command_error(&command, &e)).await;
            let help = usage(&command.command, &config);
            return Json(command_error_reply(&e, &help)).into_response();
        }
    };

    info!(
        "User {} ({}) requested {}",
        command.user_name,
        command.user_id,
        target.describe()
    );

    match (config.server.reply_mode, command.response_url.clone()) {
        (ReplyMode::Deferred, Some(response_url)) => {
            let ack = acknowledgment_reply(&target);
            let shared_state = state.clone();

            // Slack only waits 3 seconds for the HTTP response
            tokio::spawn(async move {
                let mut reply = run_deploy(&shared_state, &command, &target).await;
                if reply.response_type == ResponseType::Ephemeral {
                    reply = reply.replacing_original();
                }
                if let Err(e) = shared_state.replies.send(&response_url, &reply).await {
                    error!("Could not deliver result for {}: {}", target.describe(), e);
                }
            });

            Json(ack).into_response()
        }
        _ => {
            // Spawned so the trigger and its audit record complete even if
            // the caller hangs up before the build API answers
            let description = target.describe();
            let shared_state = state.clone();
            let task =
                tokio::spawn(async move { run_deploy(&shared_state, &command, &target).await });
            match task.await {
                Ok(reply) => Json(reply).into_response(),
                Err(e) => {
                    error!("Deploy task for {} failed: {}", description, e);
                    (StatusCode::INTERNAL_SERVER_ERROR, "deploy task failed").into_response()
                }
            }
        }
    }
}

async fn run_deploy(state: &AppState, command: &SlashCommand, target: &DeployTarget) -> SlashReply {
    let outcome = state.builds.run_trigger(target).await;
    write_audit(state, AuditRecord::from_outcome(command, target, &outcome)).await;
    outcome_reply(&command.user_name, target, &outcome)
}

/// Audit failures are logged; they never change what the user sees.
async fn write_audit(state: &AppState, record: AuditRecord) {
    if let Err(e) = state.audit.record(&record).await {
        error!("Failed to write audit record {}: {}", record.id, e);
    }
}
