//! Dispatch pipeline.
//!
//! Each routable message type owns a fixed, ordered list of stages built once
//! at startup. Stages run in order and the first rejection short-circuits:
//! the sender gets exactly one error envelope and the handler never runs.
use std::collections::HashMap;
use std::sync::Arc;

use chat_protocol::{ChannelId, Envelope, Frame, MessageType};
use tracing::{debug, error};

use crate::connection::Session;
use crate::error::{ChatError, DomainError, INVALID_MESSAGE_TYPE, MALFORMED_MESSAGE};
use crate::handlers;
use crate::identity::Identity;
use crate::server::ChatServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Kick,
    Mute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Payload matches the schema of its type.
    Shape,
    /// The addressed channel exists.
    Channel,
    /// The sender is a member of the channel.
    Membership,
    /// The sender has no active mute in the channel.
    NotMuted,
    /// The sender holds the capability in the channel.
    Permission(Capability),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Rejected(String),
    /// The session no longer owns its identity; the connection must stop reading.
    Displaced,
}

impl Outcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }
}

/// Terminal handler an accepted message is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    JoinChannel,
    LeaveChannel,
    SendChat,
    React,
    Kick,
    Mute,
    Unmute,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    action: Action,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn action(&self) -> Action {
        self.action
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    /// Append a stage. A stage already present is not added twice.
    pub fn stage(mut self, stage: Stage) -> Self {
        if !self.stages.contains(&stage) {
            self.stages.push(stage);
        }
        self
    }

    pub fn handle(self, action: Action) -> Pipeline {
        Pipeline { stages: self.stages, action }
    }
}

/// Message type -> pipeline. Types without an entry are not routable after
/// the handshake.
#[derive(Debug, Clone)]
pub struct DispatchTable {
    pipelines: HashMap<MessageType, Pipeline>,
}

impl DispatchTable {
    pub fn standard() -> Self {
        use Stage::*;
        let in_channel = || Pipeline::builder().stage(Shape).stage(Channel).stage(Membership);
        let chat = || in_channel().stage(NotMuted);
        let moderation = |cap| in_channel().stage(Permission(cap));

        let pipelines = HashMap::from([
            (MessageType::ChannelJoin, Pipeline::builder().stage(Shape).handle(Action::JoinChannel)),
            (MessageType::ChannelLeave, in_channel().handle(Action::LeaveChannel)),
            (MessageType::ChatSend, chat().handle(Action::SendChat)),
            (MessageType::ChatReactAdd, chat().handle(Action::React)),
            (MessageType::ChatReactRemove, chat().handle(Action::React)),
            (MessageType::ChatKick, moderation(Capability::Kick).handle(Action::Kick)),
            (MessageType::ChatMute, moderation(Capability::Mute).handle(Action::Mute)),
            (MessageType::ChatUnmute, moderation(Capability::Mute).handle(Action::Unmute)),
        ]);
        Self { pipelines }
    }

    pub fn get(&self, message_type: MessageType) -> Option<&Pipeline> {
        self.pipelines.get(&message_type)
    }
}

/// A routed frame as it moves through the stages.
struct Request {
    frame: Option<Frame>,
    envelope: Option<Envelope>,
}

impl Request {
    fn channel_id(&self) -> Result<ChannelId, ChatError> {
        self.envelope
            .as_ref()
            .and_then(|e| e.message.channel_id())
            .ok_or_else(|| ChatError::Protocol("stage needs a decoded channel payload".into()))
    }

    fn decode(&mut self, server: &ChatServer) -> Result<(), ChatError> {
        if let Some(frame) = self.frame.take() {
            self.envelope = Some(server.registry.decode_frame(frame)?);
        }
        Ok(())
    }
}

impl Stage {
    async fn run(
        self,
        server: &ChatServer,
        identity: &Identity,
        req: &mut Request,
    ) -> Result<(), ChatError> {
        match self {
            Stage::Shape => req.decode(server),
            Stage::Channel => {
                let id = req.channel_id()?;
                if server.hub.lock().await.channels.exists(id) {
                    Ok(())
                } else {
                    Err(DomainError::ChannelNotFound.into())
                }
            }
            Stage::Membership => {
                let id = req.channel_id()?;
                if server.hub.lock().await.membership.is_member(identity, id) {
                    Ok(())
                } else {
                    Err(DomainError::NotAMember.into())
                }
            }
            Stage::NotMuted => {
                let id = req.channel_id()?;
                if server.moderation.is_muted(identity, id).await? {
                    Err(DomainError::Muted.into())
                } else {
                    Ok(())
                }
            }
            Stage::Permission(capability) => {
                let id = req.channel_id()?;
                if server.config.can(identity, id, capability) {
                    Ok(())
                } else {
                    Err(DomainError::PermissionDenied.into())
                }
            }
        }
    }
}

/// Route one registered frame from `session` through its pipeline.
pub(crate) async fn dispatch(server: &ChatServer, session: &Arc<Session>, frame: Frame) -> Outcome {
    let message_type = frame.message_type;
    let conn_id = session.conn_id();
    let Some(pipeline) = server.table.get(message_type) else {
        debug!(conn_id, ty=%message_type, "type not routable after handshake");
        return server.reject(session, INVALID_MESSAGE_TYPE).await;
    };

    let mut req = Request { frame: Some(frame), envelope: None };
    for stage in pipeline.stages() {
        if let Err(e) = stage.run(server, session.identity(), &mut req).await {
            if let ChatError::Infrastructure(_) = e {
                error!(conn_id, ty=%message_type, ?stage, %e, "stage failed");
            } else {
                debug!(conn_id, ty=%message_type, ?stage, %e, "message rejected");
            }
            return server.reject(session, e.client_detail()).await;
        }
    }
    // pipelines without a Shape stage still need a decoded envelope
    if let Err(e) = req.decode(server) {
        return server.reject(session, e.client_detail()).await;
    }
    let Some(envelope) = req.envelope else {
        return server.reject(session, MALFORMED_MESSAGE).await;
    };
    handlers::handle(server, session, pipeline.action(), envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use Stage::*;

    #[test]
    fn stage_lists_are_fixed_per_action() {
        let table = DispatchTable::standard();
        let stages = |ty| table.get(ty).map(|p| p.stages().to_vec());

        assert_eq!(stages(MessageType::ChannelJoin), Some(vec![Shape]));
        assert_eq!(stages(MessageType::ChannelLeave), Some(vec![Shape, Channel, Membership]));
        let chat = vec![Shape, Channel, Membership, NotMuted];
        assert_eq!(stages(MessageType::ChatSend), Some(chat.clone()));
        assert_eq!(stages(MessageType::ChatReactAdd), Some(chat.clone()));
        assert_eq!(stages(MessageType::ChatReactRemove), Some(chat));
        assert_eq!(
            stages(MessageType::ChatKick),
            Some(vec![Shape, Channel, Membership, Permission(Capability::Kick)])
        );
        for ty in [MessageType::ChatMute, MessageType::ChatUnmute] {
            assert_eq!(
                stages(ty),
                Some(vec![Shape, Channel, Membership, Permission(Capability::Mute)])
            );
        }
    }

    #[test]
    fn hello_and_error_are_not_routable() {
        let table = DispatchTable::standard();
        assert!(table.get(MessageType::Hello).is_none());
        assert!(table.get(MessageType::Error).is_none());
    }

    #[test]
    fn builder_keeps_order_and_skips_duplicates() {
        let p = Pipeline::builder()
            .stage(Shape)
            .stage(Channel)
            .stage(Shape)
            .handle(Action::LeaveChannel);
        assert_eq!(p.stages(), &[Shape, Channel]);
        assert_eq!(p.action(), Action::LeaveChannel);
    }
}
