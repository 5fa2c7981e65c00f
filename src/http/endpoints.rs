//! Thin wrappers that build a [`Request`] and hand it to [`Http::request`].

use serde_json::{json, Value};

use super::routing::Route;
use super::{Http, Request};
use crate::error::ClientError;
use crate::model::*;

/// Bulk deletes accept between this many messages...
pub const BULK_DELETE_MIN: usize = 2;
/// ...and this many, inclusive.
pub const BULK_DELETE_MAX: usize = 100;

/// Webhook names must be this long...
pub const WEBHOOK_NAME_MIN: usize = 2;
/// ...and at most this long.
pub const WEBHOOK_NAME_MAX: usize = 32;

impl Http {
    pub async fn get_gateway(&self) -> Result<String, ClientError> {
        let res: GatewayResponse = self.request_as(Request::new(Route::GET_GATEWAY)).await?;
        Ok(res.url)
    }

    pub async fn get_gateway_bot(&self) -> Result<GatewayBotResponse, ClientError> {
        self.request_as(Request::new(Route::GET_GATEWAY_BOT)).await
    }

    pub async fn get_me(&self) -> Result<User, ClientError> {
        self.request_as(Request::new(Route::GET_CURRENT_USER)).await
    }

    pub async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
    ) -> Result<Message, ClientError> {
        let payload = MessageCreatePayload {
            content: Some(content.to_string()),
            ..Default::default()
        };
        self.create_message(channel_id, &payload).await
    }

    pub async fn create_message(
        &self,
        channel_id: &str,
        payload: &MessageCreatePayload,
    ) -> Result<Message, ClientError> {
        let request = Request::new(Route::CREATE_MESSAGE)
            .param("channel", channel_id)
            .json(payload)?;
        self.request_as(request).await
    }

    pub async fn edit_message(
        &self,
        channel_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, ClientError> {
        let request = Request::new(Route::EDIT_MESSAGE)
            .param("channel", channel_id)
            .param("message", message_id)
            .json(&json!({ "content": content }))?;
        self.request_as(request).await
    }

    pub async fn delete_message(
        &self,
        channel_id: &str,
        message_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::DELETE_MESSAGE)
            .param("channel", channel_id)
            .param("message", message_id)
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    /// Deletes 2 to 100 messages at once. Anything outside that range is rejected before a
    /// request is made.
    pub async fn bulk_delete_messages(
        &self,
        channel_id: &str,
        message_ids: &[&str],
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        if !(BULK_DELETE_MIN..=BULK_DELETE_MAX).contains(&message_ids.len()) {
            return Err(ClientError::InvalidArgument(format!(
                "bulk delete requires between {} and {} messages, got {}",
                BULK_DELETE_MIN,
                BULK_DELETE_MAX,
                message_ids.len()
            )));
        }

        let request = Request::new(Route::BULK_DELETE_MESSAGES)
            .param("channel", channel_id)
            .json(&json!({ "messages": message_ids }))?
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    pub async fn get_messages(
        &self,
        channel_id: &str,
        query: GetMessagesQuery,
    ) -> Result<Vec<Message>, ClientError> {
        let mut request = Request::new(Route::GET_CHANNEL_MESSAGES).param("channel", channel_id);
        if let Some(limit) = query.limit {
            request = request.query("limit", limit.min(100));
        }
        if let Some(before) = query.before {
            request = request.query("before", before);
        }
        if let Some(after) = query.after {
            request = request.query("after", after);
        }
        if let Some(around) = query.around {
            request = request.query("around", around);
        }
        self.request_as(request).await
    }

    /// `emoji` is either a unicode emoji or `name:id` for custom ones.
    pub async fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::CREATE_REACTION)
            .param("channel", channel_id)
            .param("message", message_id)
            .param("emoji", reaction_emoji(emoji));
        self.request(request).await?;
        Ok(())
    }

    pub async fn get_guild(&self, guild_id: &str) -> Result<Guild, ClientError> {
        self.request_as(Request::new(Route::GET_GUILD).param("guild", guild_id))
            .await
    }

    pub async fn create_channel(
        &self,
        guild_id: &str,
        name: &str,
        kind: ChannelType,
    ) -> Result<Channel, ClientError> {
        let request = Request::new(Route::CREATE_GUILD_CHANNEL)
            .param("guild", guild_id)
            .json(&json!({ "name": name, "type": kind as u8 }))?;
        self.request_as(request).await
    }

    pub async fn ban_member(
        &self,
        guild_id: &str,
        user_id: &str,
        delete_message_days: Option<u8>,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut request = Request::new(Route::CREATE_GUILD_BAN)
            .param("guild", guild_id)
            .param("user", user_id)
            .reason(reason);
        if let Some(days) = delete_message_days {
            request = request.query("delete-message-days", days.min(7));
        }
        self.request(request).await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User, ClientError> {
        self.request_as(Request::new(Route::GET_USER).param("user", user_id))
            .await
    }

    pub async fn modify_current_user(
        &self,
        changes: &ModifyCurrentUserPayload,
    ) -> Result<User, ClientError> {
        self.request_as(Request::new(Route::MODIFY_CURRENT_USER).json(changes)?)
            .await
    }

    /// Up to 100 guilds per page; `limit` is clamped to 1..=100.
    pub async fn get_current_user_guilds(
        &self,
        limit: Option<u8>,
        before: Option<&str>,
        after: Option<&str>,
    ) -> Result<Vec<Guild>, ClientError> {
        let mut request = Request::new(Route::GET_CURRENT_USER_GUILDS);
        if let Some(limit) = limit {
            request = request.query("limit", limit.clamp(1, 100));
        }
        if let Some(before) = before {
            request = request.query("before", before);
        }
        if let Some(after) = after {
            request = request.query("after", after);
        }
        self.request_as(request).await
    }

    pub async fn leave_guild(&self, guild_id: &str) -> Result<(), ClientError> {
        self.request(Request::new(Route::LEAVE_GUILD).param("guild", guild_id))
            .await?;
        Ok(())
    }

    /// Opens (or returns the existing) direct message channel with a user.
    pub async fn create_dm(&self, recipient_id: &str) -> Result<Channel, ClientError> {
        let request =
            Request::new(Route::CREATE_DM).json(&json!({ "recipient_id": recipient_id }))?;
        self.request_as(request).await
    }

    pub async fn create_guild(&self, name: &str) -> Result<Guild, ClientError> {
        self.request_as(Request::new(Route::CREATE_GUILD).json(&json!({ "name": name }))?)
            .await
    }

    /// `changes` is sent as is, so any guild setting the API accepts can go in.
    pub async fn modify_guild(
        &self,
        guild_id: &str,
        changes: &Value,
        reason: Option<&str>,
    ) -> Result<Guild, ClientError> {
        let request = Request::new(Route::MODIFY_GUILD)
            .param("guild", guild_id)
            .json(changes)?
            .reason(reason);
        self.request_as(request).await
    }

    pub async fn delete_guild(&self, guild_id: &str) -> Result<(), ClientError> {
        self.request(Request::new(Route::DELETE_GUILD).param("guild", guild_id))
            .await?;
        Ok(())
    }

    pub async fn get_guild_channels(&self, guild_id: &str) -> Result<Vec<Channel>, ClientError> {
        self.request_as(Request::new(Route::GET_GUILD_CHANNELS).param("guild", guild_id))
            .await
    }

    pub async fn get_member(&self, guild_id: &str, user_id: &str) -> Result<Member, ClientError> {
        let request = Request::new(Route::GET_GUILD_MEMBER)
            .param("guild", guild_id)
            .param("member", user_id);
        self.request_as(request).await
    }

    /// One page of members, ordered by user id. `limit` is clamped to 1..=1000.
    pub async fn list_members(
        &self,
        guild_id: &str,
        limit: Option<u16>,
        after: Option<&str>,
    ) -> Result<Vec<Member>, ClientError> {
        let mut request = Request::new(Route::LIST_GUILD_MEMBERS).param("guild", guild_id);
        if let Some(limit) = limit {
            request = request.query("limit", limit.clamp(1, 1000));
        }
        if let Some(after) = after {
            request = request.query("after", after);
        }
        self.request_as(request).await
    }

    pub async fn modify_member(
        &self,
        guild_id: &str,
        user_id: &str,
        changes: &ModifyMemberPayload,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::MODIFY_GUILD_MEMBER)
            .param("guild", guild_id)
            .param("member", user_id)
            .json(changes)?
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    /// Kicks a member.
    pub async fn remove_member(
        &self,
        guild_id: &str,
        user_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::REMOVE_GUILD_MEMBER)
            .param("guild", guild_id)
            .param("member", user_id)
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    pub async fn add_member_role(
        &self,
        guild_id: &str,
        user_id: &str,
        role_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::ADD_GUILD_MEMBER_ROLE)
            .param("guild", guild_id)
            .param("member", user_id)
            .param("role", role_id)
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    pub async fn remove_member_role(
        &self,
        guild_id: &str,
        user_id: &str,
        role_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::REMOVE_GUILD_MEMBER_ROLE)
            .param("guild", guild_id)
            .param("member", user_id)
            .param("role", role_id)
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    pub async fn get_bans(&self, guild_id: &str) -> Result<Vec<Ban>, ClientError> {
        self.request_as(Request::new(Route::GET_GUILD_BANS).param("guild", guild_id))
            .await
    }

    pub async fn unban_member(
        &self,
        guild_id: &str,
        user_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::REMOVE_GUILD_BAN)
            .param("guild", guild_id)
            .param("user", user_id)
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    pub async fn get_roles(&self, guild_id: &str) -> Result<Vec<Role>, ClientError> {
        self.request_as(Request::new(Route::GET_GUILD_ROLES).param("guild", guild_id))
            .await
    }

    pub async fn create_role(
        &self,
        guild_id: &str,
        role: &CreateRolePayload,
        reason: Option<&str>,
    ) -> Result<Role, ClientError> {
        let request = Request::new(Route::CREATE_GUILD_ROLE)
            .param("guild", guild_id)
            .json(role)?
            .reason(reason);
        self.request_as(request).await
    }

    pub async fn delete_role(
        &self,
        guild_id: &str,
        role_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::DELETE_GUILD_ROLE)
            .param("guild", guild_id)
            .param("role", role_id)
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    /// The raw audit log object. `limit` is clamped to 1..=100.
    pub async fn get_audit_log(
        &self,
        guild_id: &str,
        query: AuditLogQuery,
    ) -> Result<Value, ClientError> {
        let mut request = Request::new(Route::GET_GUILD_AUDIT_LOG).param("guild", guild_id);
        if let Some(user_id) = query.user_id {
            request = request.query("user_id", user_id);
        }
        if let Some(action) = query.action_type {
            request = request.query("action_type", action);
        }
        if let Some(before) = query.before {
            request = request.query("before", before);
        }
        if let Some(limit) = query.limit {
            request = request.query("limit", limit.clamp(1, 100));
        }
        self.request(request).await
    }

    pub async fn get_channel(&self, channel_id: &str) -> Result<Channel, ClientError> {
        self.request_as(Request::new(Route::GET_CHANNEL).param("channel", channel_id))
            .await
    }

    /// `changes` is sent as is, like [`modify_guild`](Self::modify_guild).
    pub async fn modify_channel(
        &self,
        channel_id: &str,
        changes: &Value,
        reason: Option<&str>,
    ) -> Result<Channel, ClientError> {
        let request = Request::new(Route::MODIFY_CHANNEL)
            .param("channel", channel_id)
            .json(changes)?
            .reason(reason);
        self.request_as(request).await
    }

    /// Deletes a guild channel, or closes a DM. Returns the channel as it was.
    pub async fn delete_channel(
        &self,
        channel_id: &str,
        reason: Option<&str>,
    ) -> Result<Channel, ClientError> {
        let request = Request::new(Route::DELETE_CHANNEL)
            .param("channel", channel_id)
            .reason(reason);
        self.request_as(request).await
    }

    pub async fn get_message(
        &self,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Message, ClientError> {
        let request = Request::new(Route::GET_CHANNEL_MESSAGE)
            .param("channel", channel_id)
            .param("message", message_id);
        self.request_as(request).await
    }

    pub async fn delete_own_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::DELETE_OWN_REACTION)
            .param("channel", channel_id)
            .param("message", message_id)
            .param("emoji", reaction_emoji(emoji));
        self.request(request).await?;
        Ok(())
    }

    pub async fn trigger_typing(&self, channel_id: &str) -> Result<(), ClientError> {
        let request = Request::new(Route::TRIGGER_TYPING_INDICATOR).param("channel", channel_id);
        self.request(request).await?;
        Ok(())
    }

    pub async fn get_pinned_messages(&self, channel_id: &str) -> Result<Vec<Message>, ClientError> {
        self.request_as(Request::new(Route::GET_PINNED_MESSAGES).param("channel", channel_id))
            .await
    }

    /// `name` must be 2 to 32 characters after trimming.
    pub async fn create_webhook(
        &self,
        channel_id: &str,
        name: &str,
        avatar: Option<&str>,
    ) -> Result<Webhook, ClientError> {
        let name = name.trim();
        let len = name.chars().count();
        if !(WEBHOOK_NAME_MIN..=WEBHOOK_NAME_MAX).contains(&len) {
            return Err(ClientError::InvalidArgument(format!(
                "webhook name must be between {} and {} characters, got {}",
                WEBHOOK_NAME_MIN, WEBHOOK_NAME_MAX, len
            )));
        }

        let request = Request::new(Route::CREATE_WEBHOOK)
            .param("channel", channel_id)
            .json(&json!({ "name": name, "avatar": avatar }))?;
        self.request_as(request).await
    }

    pub async fn get_webhook(&self, webhook_id: &str) -> Result<Webhook, ClientError> {
        self.request_as(Request::new(Route::GET_WEBHOOK).param("webhook", webhook_id))
            .await
    }

    pub async fn delete_webhook(
        &self,
        webhook_id: &str,
        reason: Option<&str>,
    ) -> Result<(), ClientError> {
        let request = Request::new(Route::DELETE_WEBHOOK)
            .param("webhook", webhook_id)
            .reason(reason);
        self.request(request).await?;
        Ok(())
    }

    /// Posts through a webhook. With `wait` the created message is returned, otherwise the
    /// API answers with no content and this returns `None`.
    pub async fn execute_webhook(
        &self,
        webhook_id: &str,
        token: &str,
        payload: &ExecuteWebhookPayload,
        wait: bool,
    ) -> Result<Option<Message>, ClientError> {
        if payload.content.as_deref().unwrap_or_default().is_empty() {
            return Err(ClientError::InvalidArgument("webhook messages need content".into()));
        }

        let request = Request::new(Route::EXECUTE_WEBHOOK)
            .param("webhook", webhook_id)
            .param("token", token)
            .query("wait", wait)
            .json(payload)?;
        match self.request(request).await? {
            Value::Null => Ok(None),
            data => Ok(Some(serde_json::from_value(data)?)),
        }
    }
}

/// Strips the `<:name:id>` / `<a:name:id>` wrapping of custom emoji and percent-encodes the rest.
fn reaction_emoji(emoji: &str) -> String {
    let emoji = emoji
        .trim_start_matches("<a:")
        .trim_start_matches("<:")
        .trim_end_matches('>');
    urlencoding::encode(emoji).into_owned()
}
