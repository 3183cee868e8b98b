//! One-shot commands against a server's command service.

use std::sync::Arc;

use prost_types::Struct;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::SessionError;
use crate::options::CommandOptions;
use crate::protocol::{CommandMessage, CommandReply, GetCommandsReply, GetCommandsRequest};
use crate::stream::OutboundMessage;

/// Runs named commands over a connection.
#[derive(Debug, Clone)]
pub struct CommandClient {
    connection: Arc<Connection>,
    options: CommandOptions,
}

impl CommandClient {
    /// Client using the command paths in `options`.
    #[must_use]
    pub fn new(connection: Arc<Connection>, options: CommandOptions) -> Self {
        Self {
            connection,
            options,
        }
    }

    /// Playback command names.
    #[must_use]
    pub fn options(&self) -> &CommandOptions {
        &self.options
    }

    /// Run `name` and wait for its result.
    pub async fn run_command(
        &self,
        name: &str,
        arguments: Option<Struct>,
    ) -> Result<Struct, SessionError> {
        let request = CommandMessage {
            name: name.to_owned(),
            arguments,
        };
        request.validate().map_err(SessionError::ArgumentInvalid)?;
        let reply: CommandReply = self
            .connection
            .unary(&self.options.run_method, &request)
            .await?;
        log::debug!("command {name} completed");
        Ok(reply.result.unwrap_or_default())
    }

    /// Run `name` on a detached task. Failures are logged and dropped.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run_detached(&self, name: &str) -> JoinHandle<()> {
        let client = self.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            if let Err(e) = client.run_command(&name, None).await {
                log::warn!("command {name} failed: {e}");
            }
        })
    }

    /// Names of the commands the server accepts.
    pub async fn available_commands(&self) -> Result<Vec<String>, SessionError> {
        let reply: GetCommandsReply = self
            .connection
            .unary(&self.options.list_method, &GetCommandsRequest {})
            .await?;
        Ok(reply.commands.into_iter().map(|command| command.name).collect())
    }
}
