//! Terminal handlers. They run only after every pipeline stage passed.
use std::sync::Arc;

use chat_protocol::{
    ChannelId, ChannelJoinPayload, ChannelLeavePayload, ChatSendPayload, Envelope, KickPayload,
    MutePayload, ProtocolMessage, ReactionPayload, UnmutePayload, UserInfo,
};
use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::Session;
use crate::dispatch::{Action, Outcome};
use crate::error::{DomainError, GUEST_JOIN_DENIED, MALFORMED_MESSAGE};
use crate::identity::Identity;
use crate::server::ChatServer;
use crate::store::StoredMessage;

pub(crate) async fn handle(
    server: &ChatServer,
    session: &Arc<Session>,
    action: Action,
    envelope: Envelope,
) -> Outcome {
    match (action, envelope.message) {
        (Action::JoinChannel, ProtocolMessage::ChannelJoin(p)) => {
            join_channel(server, session, p.channel_id).await
        }
        (Action::LeaveChannel, ProtocolMessage::ChannelLeave(p)) => {
            leave_channel(server, session.identity(), p.channel_id).await
        }
        (Action::SendChat, ProtocolMessage::ChatSend(p)) => send_chat(server, session, p).await,
        (Action::React, ProtocolMessage::ChatReactAdd(p)) => react(server, session, p, true).await,
        (Action::React, ProtocolMessage::ChatReactRemove(p)) => {
            react(server, session, p, false).await
        }
        (Action::Kick, ProtocolMessage::ChatKick(p)) => kick(server, session, p).await,
        (Action::Mute, ProtocolMessage::ChatMute(p)) => mute(server, session, p).await,
        (Action::Unmute, ProtocolMessage::ChatUnmute(p)) => unmute(server, session, p).await,
        (action, message) => {
            error!(?action, ty=%message.message_type(), "message routed to mismatched handler");
            server.reject(session, MALFORMED_MESSAGE).await
        }
    }
}

async fn join_channel(server: &ChatServer, session: &Arc<Session>, channel_id: ChannelId) -> Outcome {
    let identity = session.identity();
    let members = {
        let mut hub = server.hub.lock().await;
        hub.channels.create_channel(channel_id);
        let joined = hub.membership.join(identity, channel_id);
        match joined {
            Ok(true) => hub.membership.get_members(channel_id),
            Ok(false) => {
                debug!(conn_id = session.conn_id(), channel = channel_id, "already a member");
                return Outcome::Continue;
            }
            Err(e) => {
                drop(hub);
                debug!(conn_id = session.conn_id(), channel = channel_id, %e, "join denied");
                return server.reject(session, GUEST_JOIN_DENIED).await;
            }
        }
    };

    replay_history(server, session, channel_id).await;

    let env = Envelope::stamped(ProtocolMessage::ChannelJoin(ChannelJoinPayload {
        channel_id,
        user: Some(identity.user_info()),
    }));
    let delivered = server.broker.send_to_channel(&members, &env).await;
    info!(user=%identity.username(), channel = channel_id, delivered, "joined channel");
    Outcome::Continue
}

async fn replay_history(server: &ChatServer, session: &Session, channel_id: ChannelId) {
    let history = match server
        .config
        .store
        .get_channel_messages(channel_id, server.config.history_limit)
        .await
    {
        Ok(h) => h,
        Err(e) => {
            warn!(channel = channel_id, %e, "history load failed; skipping replay");
            return;
        }
    };
    let count = history.len();
    for m in history {
        let env = Envelope {
            timestamp: Some(m.timestamp),
            id: Some(m.id),
            message: ProtocolMessage::ChatSend(ChatSendPayload {
                channel_id,
                sender: Some(UserInfo::new(m.sender_username)),
                content: m.content,
            }),
        };
        if !server.broker.deliver(session, &env).await {
            break;
        }
    }
    if count > 0 {
        debug!(conn_id = session.conn_id(), channel = channel_id, count, "replayed history");
    }
}

async fn leave_channel(server: &ChatServer, identity: &Identity, channel_id: ChannelId) -> Outcome {
    let remaining = {
        let mut hub = server.hub.lock().await;
        if !hub.membership.leave(identity, channel_id) {
            return Outcome::Continue;
        }
        hub.membership.get_members(channel_id)
    };
    notify_leave(server, identity, channel_id, &remaining).await;
    info!(user=%identity.username(), channel = channel_id, "left channel");
    Outcome::Continue
}

pub(crate) async fn notify_leave(
    server: &ChatServer,
    identity: &Identity,
    channel_id: ChannelId,
    remaining: &[Identity],
) -> usize {
    let env = Envelope::stamped(ProtocolMessage::ChannelLeave(ChannelLeavePayload {
        channel_id,
        user: Some(identity.user_info()),
    }));
    server.broker.send_to_channel(remaining, &env).await
}

async fn send_chat(server: &ChatServer, session: &Arc<Session>, p: ChatSendPayload) -> Outcome {
    let identity = session.identity();
    let Some(sender_id) = identity.user_id() else {
        return server.reject(session, DomainError::PermissionDenied.detail()).await;
    };
    let Some(members) = audience(server, identity, p.channel_id).await else {
        return server.reject(session, DomainError::NotAMember.detail()).await;
    };
    let stored = StoredMessage {
        id: Uuid::new_v4(),
        channel_id: p.channel_id,
        sender_id,
        sender_username: identity.username().to_string(),
        timestamp: Utc::now(),
        content: p.content,
    };
    if let Err(e) = server.config.store.create_message(&stored).await {
        error!(channel = p.channel_id, %e, "failed to persist message; delivering anyway");
    }

    let env = Envelope {
        timestamp: Some(stored.timestamp),
        id: Some(stored.id),
        message: ProtocolMessage::ChatSend(ChatSendPayload {
            channel_id: stored.channel_id,
            sender: Some(identity.user_info()),
            content: stored.content,
        }),
    };
    let delivered = server.broker.send_to_channel(&members, &env).await;
    debug!(conn_id = session.conn_id(), channel = p.channel_id, delivered, "chat message fanned out");
    Outcome::Continue
}

async fn react(server: &ChatServer, session: &Arc<Session>, p: ReactionPayload, add: bool) -> Outcome {
    let identity = session.identity();
    let channel_id = p.channel_id;
    let Some(members) = audience(server, identity, channel_id).await else {
        return server.reject(session, DomainError::NotAMember.detail()).await;
    };
    let payload = ReactionPayload { user: Some(identity.user_info()), ..p };
    let message = if add {
        ProtocolMessage::ChatReactAdd(payload)
    } else {
        ProtocolMessage::ChatReactRemove(payload)
    };
    server.broker.send_to_channel(&members, &Envelope::stamped(message)).await;
    Outcome::Continue
}

/// Members of `channel_id`, or `None` if `identity` has left it since the
/// pipeline's membership check.
async fn audience(
    server: &ChatServer,
    identity: &Identity,
    channel_id: ChannelId,
) -> Option<Vec<Identity>> {
    let hub = server.hub.lock().await;
    if !hub.membership.is_member(identity, channel_id) {
        return None;
    }
    Some(hub.membership.get_members(channel_id))
}

/// Resolve a moderation target by username among the channel's members,
/// returning it with a snapshot of all members.
async fn resolve_target(
    server: &ChatServer,
    channel_id: ChannelId,
    username: &str,
) -> Option<(Identity, Vec<Identity>)> {
    let hub = server.hub.lock().await;
    let target = hub.membership.find_member_by_name(channel_id, username)?;
    Some((target, hub.membership.get_members(channel_id)))
}

async fn kick(server: &ChatServer, session: &Arc<Session>, p: KickPayload) -> Outcome {
    let channel_id = p.channel_id;
    let Some((target, members)) = resolve_target(server, channel_id, &p.target).await else {
        return server.reject(session, DomainError::TargetNotFound.detail()).await;
    };

    // the target sees its own kick before the edge goes away
    server
        .broker
        .send_to_channel(&members, &Envelope::stamped(ProtocolMessage::ChatKick(p.clone())))
        .await;

    let remaining = {
        let mut hub = server.hub.lock().await;
        if !hub.membership.leave(&target, channel_id) {
            return Outcome::Continue;
        }
        hub.membership.get_members(channel_id)
    };
    notify_leave(server, &target, channel_id, &remaining).await;
    info!(
        issuer=%session.identity().username(),
        target=%target.username(),
        channel = channel_id,
        reason=%p.reason,
        "kicked member"
    );
    Outcome::Continue
}

async fn mute(server: &ChatServer, session: &Arc<Session>, p: MutePayload) -> Outcome {
    let channel_id = p.channel_id;
    let Some((target, members)) = resolve_target(server, channel_id, &p.target).await else {
        return server.reject(session, DomainError::TargetNotFound.detail()).await;
    };
    let issuer = session.identity();
    if let Err(e) = server
        .moderation
        .mute(&target, issuer, channel_id, p.duration, &p.reason)
        .await
    {
        error!(target=%target.username(), channel = channel_id, %e, "mute failed");
        return server.reject(session, e.client_detail()).await;
    }
    info!(
        issuer=%issuer.username(),
        target=%target.username(),
        channel = channel_id,
        duration = ?p.duration,
        "muted member"
    );
    server
        .broker
        .send_to_channel(&members, &Envelope::stamped(ProtocolMessage::ChatMute(p)))
        .await;
    Outcome::Continue
}

async fn unmute(server: &ChatServer, session: &Arc<Session>, p: UnmutePayload) -> Outcome {
    let channel_id = p.channel_id;
    let Some((target, members)) = resolve_target(server, channel_id, &p.target).await else {
        return server.reject(session, DomainError::TargetNotFound.detail()).await;
    };
    match server.moderation.unmute(&target, channel_id).await {
        Ok(existed) => {
            info!(target=%target.username(), channel = channel_id, existed, "unmuted member");
        }
        Err(e) => {
            error!(target=%target.username(), channel = channel_id, %e, "unmute failed");
            return server.reject(session, e.client_detail()).await;
        }
    }
    server
        .broker
        .send_to_channel(&members, &Envelope::stamped(ProtocolMessage::ChatUnmute(p)))
        .await;
    Outcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use chat_protocol::decode;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    async fn member(
        server: &ChatServer,
        conn_id: u64,
        identity: Identity,
    ) -> (Arc<Session>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let session = Arc::new(Session::new(conn_id, identity, tx));
        server.register(session.clone()).await;
        (session, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        while let Ok(Message::Text(t)) = rx.try_recv() {
            out.push(decode(t.as_str()).unwrap().message);
        }
        out
    }

    #[tokio::test(flavor = "current_thread")]
    async fn member_kicked_after_validation_cannot_fan_out() {
        let server = ChatServer::new(ServerConfig::default());
        let (alice, mut alice_rx) = member(&server, 1, Identity::registered(1, "alice")).await;
        let (_bob, mut bob_rx) = member(&server, 2, Identity::registered(2, "bob")).await;
        {
            let mut hub = server.hub.lock().await;
            hub.channels.create_channel(6);
            hub.membership.join(&Identity::registered(2, "bob"), 6).unwrap();
        }

        // alice passed the pipeline earlier but no longer holds the edge
        let say = ProtocolMessage::ChatSend(ChatSendPayload {
            channel_id: 6,
            sender: None,
            content: "too late".into(),
        });
        let outcome = handle(&server, &alice, Action::SendChat, Envelope::new(say)).await;
        assert_eq!(outcome, Outcome::Rejected(DomainError::NotAMember.detail().into()));

        let react = ProtocolMessage::ChatReactAdd(ReactionPayload {
            channel_id: 6,
            message_id: Uuid::new_v4(),
            emote: "+1".into(),
            user: None,
        });
        let outcome = handle(&server, &alice, Action::React, Envelope::new(react)).await;
        assert!(outcome.is_rejected());

        assert_eq!(drain(&mut alice_rx).len(), 2);
        assert!(drain(&mut bob_rx).is_empty());
        let stored = server.config.store.get_channel_messages(6, None).await.unwrap();
        assert!(stored.is_empty());
    }
}
