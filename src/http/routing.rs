//! Route templates and the bucket keys derived from them.

use std::fmt;

use crate::error::ClientError;

/// Path parameters that get a rate limit bucket of their own.
const MAJOR_PARAMETERS: [&str; 3] = ["guild", "channel", "webhook"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the rate limit a request counts against.
///
/// Only major parameters survive in `route`; every other placeholder is blanked, so
/// `DELETE /channels/1/messages/2` and `DELETE /channels/1/messages/3` share a bucket while
/// `/channels/1/...` and `/channels/9/...` don't.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub method: Method,
    pub route: String,
}

impl BucketKey {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.route)
    }
}

/// An API endpoint: a method and a path template with `{name}` placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub template: &'static str,
}

impl Route {
    pub const fn new(method: Method, template: &'static str) -> Self {
        Self { method, template }
    }

    // Gateway
    pub const GET_GATEWAY: Route = Route::new(Method::Get, "/gateway");
    pub const GET_GATEWAY_BOT: Route = Route::new(Method::Get, "/gateway/bot");

    // User
    pub const GET_CURRENT_USER: Route = Route::new(Method::Get, "/users/@me");
    pub const GET_USER: Route = Route::new(Method::Get, "/users/{user}");
    pub const MODIFY_CURRENT_USER: Route = Route::new(Method::Patch, "/users/@me");
    pub const GET_CURRENT_USER_GUILDS: Route = Route::new(Method::Get, "/users/@me/guilds");
    pub const LEAVE_GUILD: Route = Route::new(Method::Delete, "/users/@me/guilds/{guild}");
    pub const CREATE_DM: Route = Route::new(Method::Post, "/users/@me/channels");

    // Guild
    pub const CREATE_GUILD: Route = Route::new(Method::Post, "/guilds");
    pub const GET_GUILD: Route = Route::new(Method::Get, "/guilds/{guild}");
    pub const MODIFY_GUILD: Route = Route::new(Method::Patch, "/guilds/{guild}");
    pub const DELETE_GUILD: Route = Route::new(Method::Delete, "/guilds/{guild}");
    pub const GET_GUILD_CHANNELS: Route = Route::new(Method::Get, "/guilds/{guild}/channels");
    pub const CREATE_GUILD_CHANNEL: Route = Route::new(Method::Post, "/guilds/{guild}/channels");
    pub const GET_GUILD_MEMBER: Route = Route::new(Method::Get, "/guilds/{guild}/members/{member}");
    pub const LIST_GUILD_MEMBERS: Route = Route::new(Method::Get, "/guilds/{guild}/members");
    pub const MODIFY_GUILD_MEMBER: Route =
        Route::new(Method::Patch, "/guilds/{guild}/members/{member}");
    pub const REMOVE_GUILD_MEMBER: Route =
        Route::new(Method::Delete, "/guilds/{guild}/members/{member}");
    pub const ADD_GUILD_MEMBER_ROLE: Route =
        Route::new(Method::Put, "/guilds/{guild}/members/{member}/roles/{role}");
    pub const REMOVE_GUILD_MEMBER_ROLE: Route =
        Route::new(Method::Delete, "/guilds/{guild}/members/{member}/roles/{role}");
    pub const GET_GUILD_BANS: Route = Route::new(Method::Get, "/guilds/{guild}/bans");
    pub const CREATE_GUILD_BAN: Route = Route::new(Method::Put, "/guilds/{guild}/bans/{user}");
    pub const REMOVE_GUILD_BAN: Route = Route::new(Method::Delete, "/guilds/{guild}/bans/{user}");
    pub const GET_GUILD_ROLES: Route = Route::new(Method::Get, "/guilds/{guild}/roles");
    pub const CREATE_GUILD_ROLE: Route = Route::new(Method::Post, "/guilds/{guild}/roles");
    pub const DELETE_GUILD_ROLE: Route = Route::new(Method::Delete, "/guilds/{guild}/roles/{role}");
    pub const GET_GUILD_AUDIT_LOG: Route = Route::new(Method::Get, "/guilds/{guild}/audit-logs");

    // Channel
    pub const GET_CHANNEL: Route = Route::new(Method::Get, "/channels/{channel}");
    pub const MODIFY_CHANNEL: Route = Route::new(Method::Patch, "/channels/{channel}");
    pub const DELETE_CHANNEL: Route = Route::new(Method::Delete, "/channels/{channel}");
    pub const GET_CHANNEL_MESSAGES: Route = Route::new(Method::Get, "/channels/{channel}/messages");
    pub const GET_CHANNEL_MESSAGE: Route =
        Route::new(Method::Get, "/channels/{channel}/messages/{message}");
    pub const CREATE_MESSAGE: Route = Route::new(Method::Post, "/channels/{channel}/messages");
    pub const EDIT_MESSAGE: Route =
        Route::new(Method::Patch, "/channels/{channel}/messages/{message}");
    pub const DELETE_MESSAGE: Route =
        Route::new(Method::Delete, "/channels/{channel}/messages/{message}");
    pub const BULK_DELETE_MESSAGES: Route =
        Route::new(Method::Post, "/channels/{channel}/messages/bulk-delete");
    pub const CREATE_REACTION: Route = Route::new(
        Method::Put,
        "/channels/{channel}/messages/{message}/reactions/{emoji}/@me",
    );
    pub const DELETE_OWN_REACTION: Route = Route::new(
        Method::Delete,
        "/channels/{channel}/messages/{message}/reactions/{emoji}/@me",
    );
    pub const TRIGGER_TYPING_INDICATOR: Route =
        Route::new(Method::Post, "/channels/{channel}/typing");
    pub const GET_PINNED_MESSAGES: Route = Route::new(Method::Get, "/channels/{channel}/pins");

    // Webhook
    pub const CREATE_WEBHOOK: Route = Route::new(Method::Post, "/channels/{channel}/webhooks");
    pub const GET_WEBHOOK: Route = Route::new(Method::Get, "/webhooks/{webhook}");
    pub const DELETE_WEBHOOK: Route = Route::new(Method::Delete, "/webhooks/{webhook}");
    pub const EXECUTE_WEBHOOK: Route = Route::new(Method::Post, "/webhooks/{webhook}/{token}");

    /// Fills in the template, returning the request path and the bucket it belongs to.
    pub fn compile(&self, params: &[(&str, String)]) -> Result<(String, BucketKey), ClientError> {
        let mut path = String::with_capacity(self.template.len() + 32);
        let mut bucket = String::with_capacity(self.template.len());
        let mut rest = self.template;

        while let Some(start) = rest.find('{') {
            let end = rest[start..]
                .find('}')
                .map(|offset| start + offset)
                .ok_or_else(|| ClientError::InvalidArgument(format!(
                    "unterminated placeholder in {}",
                    self.template
                )))?;

            let name = &rest[start + 1..end];
            let value = params
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.as_str())
                .ok_or_else(|| ClientError::MissingParameter {
                    route: self.template,
                    name: name.to_string(),
                })?;

            path.push_str(&rest[..start]);
            path.push_str(value);
            bucket.push_str(&rest[..start]);
            if MAJOR_PARAMETERS.contains(&name) {
                bucket.push_str(value);
            }

            rest = &rest[end + 1..];
        }

        path.push_str(rest);
        bucket.push_str(rest);

        Ok((path, BucketKey::new(self.method, bucket)))
    }
}
