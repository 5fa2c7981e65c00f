use std::sync::Arc;
use std::time::Duration;

use clamor::error::ClientError;
use clamor::http::routing::Route;
use clamor::http::{Http, Request};
use clamor::model::{
    AuditLogQuery, ExecuteWebhookPayload, GetMessagesQuery, ModifyMemberPayload,
};
use tokio::time::Instant;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup() -> (MockServer, Http) {
    let server = MockServer::start().await;
    let http = Http::new("secret", server.uri())
        .with_retry_backoff(Duration::ZERO, Duration::ZERO);
    (server, http)
}

/// A fixed server clock, so bucket windows don't depend on the local one.
const DATE_HEADER: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
/// One second after [`DATE_HEADER`].
const RESET_AFTER_ONE_SECOND: &str = "1445412481";

const TRUNCATED_JSON: &[u8] = b"{\"message\": \"bad";

fn user() -> Value {
    json!({"id": "42", "username": "bot", "bot": true})
}

#[tokio::test]
async fn server_errors_are_retried_until_the_cap() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(502).set_body_json(json!({"message": "bad gateway"})))
        .expect(6)
        .mount(&server)
        .await;

    let err = http.get_me().await.unwrap_err();
    let api = match err {
        ClientError::RequestFailed(api) => api,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(api.status, 502);
    assert_eq!(api.message, "bad gateway");
    assert_eq!(api.bucket.to_string(), "GET /users/@me");
}

#[tokio::test]
async fn retry_cap_is_configurable() {
    let (server, http) = setup().await;
    let http = http.with_max_retries(1);
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    assert!(http.get_me().await.is_err());
}

#[tokio::test]
async fn rate_limited_request_succeeds_on_retry() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"message": "You are being rate limited.", "global": false})),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user()))
        .expect(1)
        .mount(&server)
        .await;

    let me = http.get_me().await.unwrap();
    assert_eq!(me.id, "42");
}

#[tokio::test]
async fn not_found_is_raised_immediately() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/guilds/81"))
        .respond_with(
            ResponseTemplate::new(404)
                .set_body_json(json!({"message": "Unknown Guild", "code": 10004})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = http.get_guild("81").await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));
    let api = err.api_error().unwrap();
    assert_eq!(api.code, Some(10004));
    assert_eq!(api.bucket.to_string(), "GET /guilds/81");
}

#[tokio::test]
async fn unauthorized_is_raised_immediately() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"message": "401: Unauthorized"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    assert!(matches!(http.get_me().await, Err(ClientError::Unauthorized(_))));
}

#[tokio::test]
async fn field_errors_are_flattened() {
    let (server, http) = setup().await;
    Mock::given(method("POST"))
        .and(path("/channels/5/messages"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "code": 50035,
            "message": "Invalid Form Body",
            "errors": {
                "content": {"_errors": [{
                    "code": "BASE_TYPE_MAX_LENGTH",
                    "message": "Must be 2000 or fewer in length."
                }]},
                "embed": {"fields": {"0": {"name": {"_errors": [
                    {"code": "BASE_TYPE_REQUIRED", "message": "This field is required"}
                ]}}}}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = http.send_message("5", "too long").await.unwrap_err();
    let api = match err {
        ClientError::Forbidden(api) => api,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(api.code, Some(50035));
    assert_eq!(api.errors["content"], "Must be 2000 or fewer in length.");
    assert_eq!(api.errors["embed.fields.0.name"], "This field is required");
}

#[tokio::test]
async fn bulk_delete_bounds() {
    let (server, http) = setup().await;
    Mock::given(method("POST"))
        .and(path("/channels/5/messages/bulk-delete"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let ids: Vec<String> = (0..101).map(|i| i.to_string()).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

    for count in [0, 1, 101] {
        let err = http
            .bulk_delete_messages("5", &ids[..count], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)), "{count} ids");
    }
    for count in [2, 100] {
        http.bulk_delete_messages("5", &ids[..count], None)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn bulk_delete_sends_the_ids() {
    let (server, http) = setup().await;
    Mock::given(method("POST"))
        .and(path("/channels/5/messages/bulk-delete"))
        .and(body_json(json!({"messages": ["1", "2", "3"]})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    http.bulk_delete_messages("5", &["1", "2", "3"], None)
        .await
        .unwrap();
}

#[tokio::test]
async fn audit_log_reason_is_percent_encoded() {
    let (server, http) = setup().await;
    Mock::given(method("DELETE"))
        .and(path("/channels/5/messages/9"))
        .and(header("x-audit-log-reason", "spam%20cleanup"))
        .and(header("authorization", "Bot secret"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    http.delete_message("5", "9", Some("spam cleanup"))
        .await
        .unwrap();
}

#[tokio::test]
async fn query_parameters_are_sent() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/channels/5/messages"))
        .and(query_param("limit", "100"))
        .and(query_param("before", "77"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let query = GetMessagesQuery {
        limit: Some(250),
        before: Some("77".into()),
        ..Default::default()
    };
    assert!(http.get_messages("5", query).await.unwrap().is_empty());
}

#[tokio::test]
async fn non_json_bodies_come_back_as_text() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/gateway"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
        .mount(&server)
        .await;

    let body = http.request(Request::new(Route::GET_GATEWAY)).await.unwrap();
    assert_eq!(body, Value::String("plain".into()));
}

#[tokio::test]
async fn missing_route_parameter_is_reported() {
    let (_server, http) = setup().await;
    let err = http
        .request(Request::new(Route::GET_GUILD))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::MissingParameter { .. }));
}

#[tokio::test]
async fn truncated_error_body_is_still_retried() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(
            ResponseTemplate::new(503).set_body_raw(TRUNCATED_JSON, "application/json"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user()))
        .expect(1)
        .mount(&server)
        .await;

    assert_eq!(http.get_me().await.unwrap().id, "42");
}

#[tokio::test]
async fn truncated_error_body_is_reported_as_text() {
    let (server, http) = setup().await;
    let http = http.with_max_retries(0);
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(
            ResponseTemplate::new(502).set_body_raw(TRUNCATED_JSON, "application/json"),
        )
        .mount(&server)
        .await;

    let api = match http.get_me().await.unwrap_err() {
        ClientError::RequestFailed(api) => api,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(api.status, 502);
    assert_eq!(api.data, Value::String("{\"message\": \"bad".into()));
    assert_eq!(api.message, "{\"message\": \"bad");
}

#[tokio::test]
async fn exhausted_bucket_delays_only_its_own_channel() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/channels/5/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset", RESET_AFTER_ONE_SECOND)
                .insert_header("date", DATE_HEADER),
        )
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channels/6/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    http.get_messages("5", GetMessagesQuery::default())
        .await
        .unwrap();

    let started = Instant::now();
    http.get_messages("6", GetMessagesQuery::default())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    let started = Instant::now();
    http.get_messages("5", GetMessagesQuery::default())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn global_rate_limit_stalls_other_routes() {
    let (server, http) = setup().await;
    let http = Arc::new(http);
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_json(json!({"message": "You are being rate limited.", "global": true}))
                .insert_header("x-ratelimit-global", "true")
                .insert_header("retry-after", "1000"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/@me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(user()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guilds/81"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "81"})))
        .expect(1)
        .mount(&server)
        .await;

    let limited = tokio::spawn({
        let http = http.clone();
        async move { http.get_me().await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    assert_eq!(http.get_guild("81").await.unwrap().id, "81");
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(limited.await.unwrap().unwrap().id, "42");
}

#[tokio::test]
async fn member_routes_fill_in_every_placeholder() {
    let (server, http) = setup().await;
    Mock::given(method("PUT"))
        .and(path("/guilds/1/members/2/roles/3"))
        .and(header("x-audit-log-reason", "promoted"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/guilds/1/members/2"))
        .and(body_json(json!({"nick": "renamed"})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guilds/1/members"))
        .and(query_param("limit", "1000"))
        .and(query_param("after", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"user": user(), "roles": ["3"], "joined_at": "2019-01-01T00:00:00+00:00"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    http.add_member_role("1", "2", "3", Some("promoted"))
        .await
        .unwrap();
    let changes = ModifyMemberPayload {
        nick: Some("renamed".into()),
        ..Default::default()
    };
    http.modify_member("1", "2", &changes, None).await.unwrap();

    let members = http.list_members("1", Some(5000), Some("2")).await.unwrap();
    assert_eq!(members[0].roles, ["3"]);
    assert_eq!(members[0].user.as_ref().unwrap().id, "42");
}

#[tokio::test]
async fn own_reaction_removal_encodes_the_emoji() {
    let (server, http) = setup().await;
    Mock::given(method("DELETE"))
        .and(path("/channels/5/messages/9/reactions/party:77/@me"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    http.delete_own_reaction("5", "9", "<a:party:77>")
        .await
        .unwrap();
}

#[tokio::test]
async fn audit_log_query_is_sent() {
    let (server, http) = setup().await;
    Mock::given(method("GET"))
        .and(path("/guilds/1/audit-logs"))
        .and(query_param("action_type", "22"))
        .and(query_param("limit", "100"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"audit_log_entries": []})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let query = AuditLogQuery {
        action_type: Some(22),
        limit: Some(200),
        ..Default::default()
    };
    let log = http.get_audit_log("1", query).await.unwrap();
    assert_eq!(log["audit_log_entries"], json!([]));
}

#[tokio::test]
async fn webhook_execution_waits_only_when_asked() {
    let (server, http) = setup().await;
    Mock::given(method("POST"))
        .and(path("/webhooks/7/tok"))
        .and(query_param("wait", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "10",
            "channel_id": "5",
            "author": {"id": "7", "username": "hook"},
            "content": "hello"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/webhooks/7/tok"))
        .and(query_param("wait", "false"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let payload = ExecuteWebhookPayload {
        content: Some("hello".into()),
        ..Default::default()
    };
    let sent = http.execute_webhook("7", "tok", &payload, true).await.unwrap();
    assert_eq!(sent.unwrap().content, "hello");
    assert!(http
        .execute_webhook("7", "tok", &payload, false)
        .await
        .unwrap()
        .is_none());

    let empty = ExecuteWebhookPayload::default();
    let err = http
        .execute_webhook("7", "tok", &empty, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidArgument(_)));
}

#[tokio::test]
async fn webhook_names_are_checked_before_sending() {
    let (server, http) = setup().await;
    Mock::given(method("POST"))
        .and(path("/channels/5/webhooks"))
        .and(body_json(json!({"name": "hooky", "avatar": null})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "7", "name": "hooky"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let long = "x".repeat(33);
    for name in ["a", " b ", long.as_str()] {
        let err = http.create_webhook("5", name, None).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)), "{name:?}");
    }
    let hook = http.create_webhook("5", " hooky ", None).await.unwrap();
    assert_eq!(hook.id, "7");
}
