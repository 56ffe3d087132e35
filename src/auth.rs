//! Static allowlist authorization

use crate::AuthConfig;
use crate::command::SlashCommand;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("user {user_id} is not allowed to deploy")]
    UserNotAllowed { user_id: String },

    #[error("workspace {team_id} is not allowed to deploy")]
    TeamNotAllowed { team_id: String },
}

pub struct Authorizer<'a> {
    config: &'a AuthConfig,
}

impl<'a> Authorizer<'a> {
    pub fn new(config: &'a AuthConfig) -> Self {
        Self { config }
    }

    /// Checks the caller against the allowlists. An empty user allowlist denies everyone;
    /// an empty team allowlist accepts any team.
    pub fn check(&self, command: &SlashCommand) -> Result<(), AuthError> {
        if !self.config.allowed_team_ids.is_empty()
            && !self
                .config
                .allowed_team_ids
                .iter()
                .any(|t| t == &command.team_id)
        {
            return Err(AuthError::TeamNotAllowed {
                team_id: command.team_id.clone(),
            });
        }

        if self
            .config
            .allowed_user_ids
            .iter()
            .any(|u| u == &command.user_id)
        {
            Ok(())
        } else {
            Err(AuthError::UserNotAllowed {
                user_id: command.user_id.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(user_id: &str, team_id: &str) -> SlashCommand {
        SlashCommand {
            user_id: user_id.to_string(),
            team_id: team_id.to_string(),
            command: "/deploy".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn allows_listed_user() {
        let config = AuthConfig {
            allowed_user_ids: vec!["U1".to_string(), "U2".to_string()],
            allowed_team_ids: vec![],
        };
        assert!(Authorizer::new(&config).check(&command("U2", "T9")).is_ok());
    }

    #[test]
    fn denies_unlisted_user() {
        let config = AuthConfig {
            allowed_user_ids: vec!["U1".to_string()],
            allowed_team_ids: vec![],
        };
        assert_eq!(
            Authorizer::new(&config).check(&command("u1", "T1")),
            Err(AuthError::UserNotAllowed {
                user_id: "u1".to_string()
            })
        );
    }

    #[test]
    fn empty_allowlist_denies_everyone() {
        let config = AuthConfig::default();
        assert!(Authorizer::new(&config).check(&command("U1", "T1")).is_err());
    }

    #[test]
    fn team_allowlist_is_checked_first() {
        let config = AuthConfig {
            allowed_user_ids: vec!["U1".to_string()],
            allowed_team_ids: vec!["T1".to_string()],
        };
        let authorizer = Authorizer::new(&config);
        assert!(authorizer.check(&command("U1", "T1")).is_ok());
        assert_eq!(
            authorizer.check(&command("U1", "T2")),
            Err(AuthError::TeamNotAllowed {
                team_id: "T2".to_string()
            })
        );
    }
}
