// Realtime insert channel (Phoenix channel protocol over websocket).
//
// One task per subscription: connect, join `realtime:public:<table>` with a
// `postgres_changes` INSERT filter, heartbeat, forward decoded rows. A dropped channel is
// logged and re-established with exponential backoff until the subscription is closed
// (task aborted).

use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

use super::MessageRecord;
use crate::backend::{BackendError, InsertCallback, Message};

const INITIAL_BACKOFF_SECS: u64 = 2;
const MAX_BACKOFF_SECS: u64 = 60;

pub(super) type TokenSource = Box<dyn Fn() -> Option<String> + Send + Sync>;

pub(super) struct ChannelParams {
    pub url: Url,
    pub table: String,
    pub heartbeat: Duration,
}

impl ChannelParams {
    fn topic(&self) -> String {
        format!("realtime:public:{}", self.table)
    }
}

pub(super) fn websocket_url(base: &Url, api_key: &str) -> Result<Url, BackendError> {
    let mut url = base
        .join("realtime/v1/websocket")
        .map_err(|e| BackendError::Subscription(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|_| BackendError::Subscription(format!("cannot use scheme {scheme}")))?;
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug)]
pub(super) enum FrameOutcome {
    Insert(Message),
    Joined,
    Failed(String),
    Ignored,
}

pub(super) fn decode_frame(text: &str, topic: &str) -> FrameOutcome {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!(%e, "realtime: unparseable frame");
            return FrameOutcome::Ignored;
        }
    };
    if frame.topic != topic {
        return FrameOutcome::Ignored;
    }
    match frame.event.as_str() {
        "postgres_changes" => {
            let data = &frame.payload["data"];
            if data["type"].as_str() != Some("INSERT") {
                return FrameOutcome::Ignored;
            }
            decode_record(&data["record"])
        }
        // Older servers send the change itself as the event name.
        "INSERT" => decode_record(&frame.payload["record"]),
        "phx_reply" => match frame.payload["status"].as_str() {
            Some("ok") => FrameOutcome::Joined,
            _ => FrameOutcome::Failed(format!("join rejected: {}", frame.payload["response"])),
        },
        "phx_error" => FrameOutcome::Failed("channel error".into()),
        "phx_close" => FrameOutcome::Failed("channel closed by server".into()),
        "system" if frame.payload["status"].as_str() == Some("error") => FrameOutcome::Failed(
            frame.payload["message"]
                .as_str()
                .unwrap_or("system error")
                .to_string(),
        ),
        _ => FrameOutcome::Ignored,
    }
}

fn decode_record(record: &serde_json::Value) -> FrameOutcome {
    let parsed = serde_json::from_value::<MessageRecord>(record.clone())
        .map_err(|e| BackendError::Decode(e.to_string()))
        .and_then(MessageRecord::into_message);
    match parsed {
        Ok(message) => FrameOutcome::Insert(message),
        Err(e) => {
            tracing::warn!(%e, "realtime: dropping undecodable insert");
            FrameOutcome::Ignored
        }
    }
}

fn join_frame(params: &ChannelParams, access_token: Option<String>, reference: u64) -> String {
    serde_json::json!({
        "topic": params.topic(),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "INSERT", "schema": "public", "table": params.table }
                ]
            },
            "access_token": access_token,
        },
        "ref": reference.to_string(),
    })
    .to_string()
}

fn heartbeat_frame(reference: u64) -> String {
    serde_json::json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

pub(super) async fn run_insert_channel(
    params: ChannelParams,
    token_source: TokenSource,
    on_insert: InsertCallback,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;
    loop {
        match tokio_tungstenite::connect_async(params.url.as_str()).await {
            Ok((ws, _response)) => {
                tracing::info!(table = %params.table, "realtime connected");
                backoff_secs = INITIAL_BACKOFF_SECS;
                match pump(ws, &params, token_source(), &on_insert).await {
                    Ok(()) => tracing::info!(table = %params.table, "realtime disconnected"),
                    Err(e) => tracing::warn!(table = %params.table, "realtime channel dropped: {e:#}"),
                }
            }
            Err(e) => {
                tracing::warn!(%e, table = %params.table, backoff_secs, "realtime connect failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

async fn pump<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    params: &ChannelParams,
    access_token: Option<String>,
    on_insert: &InsertCallback,
) -> anyhow::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let topic = params.topic();
    let (mut write, mut read) = ws.split();
    let mut next_ref: u64 = 1;

    write
        .send(WsMessage::Text(join_frame(params, access_token, next_ref).into()))
        .await?;

    let mut heartbeat = tokio::time::interval(params.heartbeat);
    // First tick fires immediately; the join above already proved liveness.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                next_ref += 1;
                write.send(WsMessage::Text(heartbeat_frame(next_ref).into())).await?;
            }
            frame = read.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                match frame? {
                    WsMessage::Text(text) => match decode_frame(text.as_str(), &topic) {
                        FrameOutcome::Insert(message) => {
                            tracing::debug!(id = message.id, "realtime insert");
                            on_insert(message);
                        }
                        FrameOutcome::Joined => tracing::info!(%topic, "realtime channel joined"),
                        FrameOutcome::Failed(reason) => anyhow::bail!(reason),
                        FrameOutcome::Ignored => {}
                    },
                    WsMessage::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "realtime:public:messages";

    #[test]
    fn websocket_url_switches_scheme() {
        let base = Url::parse("https://demo.example.co/").unwrap();
        let url = websocket_url(&base, "anon").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://demo.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn decodes_postgres_changes_insert() {
        let text = r#"{
            "topic": "realtime:public:messages",
            "event": "postgres_changes",
            "payload": {
                "ids": [1],
                "data": {
                    "type": "INSERT",
                    "schema": "public",
                    "table": "messages",
                    "commit_timestamp": "2024-03-01T12:00:00Z",
                    "record": {
                        "id": 42,
                        "created_at": "2024-03-01T12:00:00.123456",
                        "content": "hello",
                        "user_id": "u1",
                        "user_email": "a@x.com"
                    }
                }
            },
            "ref": null
        }"#;
        match decode_frame(text, TOPIC) {
            FrameOutcome::Insert(m) => {
                assert_eq!(m.id, 42);
                assert_eq!(m.content, "hello");
                assert_eq!(m.created_at, 1_709_294_400_123);
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn ignores_other_topics_and_change_types() {
        let heartbeat_reply =
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"2"}"#;
        assert!(matches!(
            decode_frame(heartbeat_reply, TOPIC),
            FrameOutcome::Ignored
        ));
        let update = r#"{"topic":"realtime:public:messages","event":"postgres_changes",
                         "payload":{"data":{"type":"UPDATE","record":{}}}}"#;
        assert!(matches!(decode_frame(update, TOPIC), FrameOutcome::Ignored));
        assert!(matches!(decode_frame("not json", TOPIC), FrameOutcome::Ignored));
    }

    #[test]
    fn join_reply_and_errors() {
        let ok = r#"{"topic":"realtime:public:messages","event":"phx_reply",
                     "payload":{"status":"ok","response":{"postgres_changes":[]}},"ref":"1"}"#;
        assert!(matches!(decode_frame(ok, TOPIC), FrameOutcome::Joined));
        let rejected = r#"{"topic":"realtime:public:messages","event":"phx_reply",
                           "payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#;
        assert!(matches!(
            decode_frame(rejected, TOPIC),
            FrameOutcome::Failed(_)
        ));
        let system = r#"{"topic":"realtime:public:messages","event":"system",
                         "payload":{"status":"error","message":"token expired"}}"#;
        match decode_frame(system, TOPIC) {
            FrameOutcome::Failed(reason) => assert_eq!(reason, "token expired"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn join_frame_carries_filter_and_token() {
        let params = ChannelParams {
            url: Url::parse("wss://demo.example.co/realtime/v1/websocket").unwrap(),
            table: "messages".into(),
            heartbeat: Duration::from_secs(25),
        };
        let frame: serde_json::Value =
            serde_json::from_str(&join_frame(&params, Some("tok".into()), 1)).unwrap();
        assert_eq!(frame["topic"], TOPIC);
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["payload"]["access_token"], "tok");
        assert_eq!(
            frame["payload"]["config"]["postgres_changes"][0]["event"],
            "INSERT"
        );
    }
}
