//! Supabase Realtime subscription over the Phoenix channel protocol.
//!
//! One task per subscription: connect, join `realtime:public:{table}`, heartbeat, forward
//! inserts, and reconnect with backoff until the subscription is released.

use std::sync::Arc;

use backend_core::{
    Backoff, BackendError, BackendErrorCategory, ChatErrorKind, Message, SubscriptionEvent,
    SubscriptionFeed, classify_http_status,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::{MissedTickBehavior, interval};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
};
use tracing::{debug, info, warn};

use crate::config::SupabaseConfig;

const PHOENIX_TOPIC: &str = "phoenix";

/// One Phoenix channel frame (`vsn=1.0.0` object encoding).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhoenixFrame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

impl PhoenixFrame {
    fn encode(&self) -> Result<String, BackendError> {
        serde_json::to_string(self).map_err(|err| {
            BackendError::for_kind(
                ChatErrorKind::Subscription,
                BackendErrorCategory::Serialization,
                err.to_string(),
            )
        })
    }
}

/// Topic of the insert channel for `table`.
pub fn channel_topic(table: &str) -> String {
    format!("realtime:public:{table}")
}

/// Join request subscribing to INSERT changes on `table`.
pub fn join_frame(table: &str, reference: &str) -> PhoenixFrame {
    PhoenixFrame {
        topic: channel_topic(table),
        event: "phx_join".to_owned(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "INSERT", "schema": "public", "table": table }
                ]
            }
        }),
        reference: Some(reference.to_owned()),
    }
}

pub fn heartbeat_frame(reference: &str) -> PhoenixFrame {
    PhoenixFrame {
        topic: PHOENIX_TOPIC.to_owned(),
        event: "heartbeat".to_owned(),
        payload: json!({}),
        reference: Some(reference.to_owned()),
    }
}

pub fn leave_frame(table: &str, reference: &str) -> PhoenixFrame {
    PhoenixFrame {
        topic: channel_topic(table),
        event: "phx_leave".to_owned(),
        payload: json!({}),
        reference: Some(reference.to_owned()),
    }
}

/// What an inbound frame means for the subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    JoinAccepted,
    JoinRejected(String),
    Inserted(Message),
    ChannelClosed(String),
    Malformed(String),
    Ignored,
}

/// Interpret a frame received on the socket.
///
/// Inserts are accepted in both the `postgres_changes` shape (`payload.data.record`) and
/// the legacy `INSERT` shape (`payload.record`).
pub fn classify_frame(frame: &PhoenixFrame, topic: &str, join_ref: &str) -> Inbound {
    if frame.topic != topic {
        return Inbound::Ignored;
    }

    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(join_ref) => {
            if frame.payload.get("status").and_then(Value::as_str) == Some("ok") {
                Inbound::JoinAccepted
            } else {
                Inbound::JoinRejected(reply_reason(&frame.payload))
            }
        }
        "postgres_changes" => {
            let data = &frame.payload["data"];
            match data.get("type").and_then(Value::as_str) {
                Some("INSERT") | None => decode_record(&data["record"]),
                Some(_) => Inbound::Ignored,
            }
        }
        "INSERT" => decode_record(&frame.payload["record"]),
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            Inbound::JoinRejected(reply_reason(&frame.payload))
        }
        "phx_error" => Inbound::ChannelClosed("channel error".to_owned()),
        "phx_close" => Inbound::ChannelClosed("channel closed by server".to_owned()),
        _ => Inbound::Ignored,
    }
}

fn decode_record(record: &Value) -> Inbound {
    if record.is_null() {
        return Inbound::Malformed("insert frame without a record".to_owned());
    }
    match Message::deserialize(record) {
        Ok(message) => Inbound::Inserted(message),
        Err(err) => Inbound::Malformed(format!("undecodable record: {err}")),
    }
}

fn reply_reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| payload.to_string())
}

/// Drive a subscription until its feed is released.
pub(crate) async fn run_subscription(config: Arc<SupabaseConfig>, feed: SubscriptionFeed) {
    let mut backoff = config.reconnect_policy.backoff();
    let mut confirmed_once = false;

    loop {
        let error = match stream_once(&config, &feed, &mut backoff, &mut confirmed_once).await {
            Ok(()) => {
                debug!("realtime subscription released");
                return;
            }
            Err(error) => error,
        };

        let delay = backoff.next_delay(error.retry_after_ms);
        warn!(
            code = %error.code,
            retry_in_ms = delay.as_millis() as u64,
            "realtime connection lost: {}",
            error.message
        );
        let dropped = SubscriptionEvent::Dropped {
            error,
            retry_in: Some(delay),
        };
        if !feed.deliver(dropped).await {
            return;
        }

        tokio::select! {
            _ = feed.released() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One connection lifetime. `Ok(())` means the consumer released the subscription.
async fn stream_once(
    config: &SupabaseConfig,
    feed: &SubscriptionFeed,
    backoff: &mut Backoff,
    confirmed_once: &mut bool,
) -> Result<(), BackendError> {
    let url = config.realtime_url();
    debug!(endpoint = %config.project_url(), table = config.table(), "connecting to realtime");
    let (socket, _) = tokio::select! {
        _ = feed.released() => return Ok(()),
        connected = connect_async(url.as_str()) => connected.map_err(map_socket_error)?,
    };
    let (mut write, mut read) = socket.split();

    let topic = channel_topic(config.table());
    let mut next_ref: u64 = 0;
    let mut take_ref = move || {
        next_ref += 1;
        next_ref.to_string()
    };

    let join_ref = take_ref();
    let join = join_frame(config.table(), &join_ref).encode()?;
    write
        .send(WsMessage::Text(join.into()))
        .await
        .map_err(map_socket_error)?;

    let mut heartbeat = interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = feed.released() => {
                if let Ok(leave) = leave_frame(config.table(), &take_ref()).encode() {
                    let _ = write.send(WsMessage::Text(leave.into())).await;
                }
                let _ = write.close().await;
                return Ok(());
            }
            _ = heartbeat.tick() => {
                let beat = heartbeat_frame(&take_ref()).encode()?;
                write
                    .send(WsMessage::Text(beat.into()))
                    .await
                    .map_err(map_socket_error)?;
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame: PhoenixFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(error = %err, "failed to parse realtime frame");
                            continue;
                        }
                    };
                    match classify_frame(&frame, &topic, &join_ref) {
                        Inbound::JoinAccepted => {
                            let resumed = *confirmed_once;
                            *confirmed_once = true;
                            backoff.reset();
                            info!(topic = %topic, resumed, "realtime channel joined");
                            if !feed.deliver(SubscriptionEvent::Ready { resumed }).await {
                                return Ok(());
                            }
                        }
                        Inbound::JoinRejected(reason) => {
                            return Err(BackendError::for_kind(
                                ChatErrorKind::Subscription,
                                BackendErrorCategory::Config,
                                format!("realtime join rejected: {reason}"),
                            ));
                        }
                        Inbound::Inserted(message) => {
                            if !feed.deliver(SubscriptionEvent::Inserted(message)).await {
                                return Ok(());
                            }
                        }
                        Inbound::ChannelClosed(reason) => {
                            return Err(dropped_error(reason));
                        }
                        Inbound::Malformed(detail) => {
                            warn!("skipping realtime frame: {detail}");
                        }
                        Inbound::Ignored => {}
                    }
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    write
                        .send(WsMessage::Pong(data))
                        .await
                        .map_err(map_socket_error)?;
                }
                Some(Ok(WsMessage::Close(_))) => {
                    return Err(dropped_error("socket closed by server"));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(map_socket_error(err)),
                None => return Err(dropped_error("socket stream ended")),
            },
        }
    }
}

fn dropped_error(reason: impl Into<String>) -> BackendError {
    BackendError::for_kind(
        ChatErrorKind::Subscription,
        BackendErrorCategory::Network,
        reason,
    )
}

fn map_socket_error(err: tungstenite::Error) -> BackendError {
    let category = match &err {
        tungstenite::Error::Http(response) => classify_http_status(response.status().as_u16()),
        tungstenite::Error::Url(_) => BackendErrorCategory::Config,
        _ => BackendErrorCategory::Network,
    };
    BackendError::for_kind(ChatErrorKind::Subscription, category, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend_core::Subscription;
    use std::time::Duration;
    use tokio::{net::TcpListener, sync::mpsc, time::timeout};
    use tokio_tungstenite::accept_async;

    fn frame(topic: &str, event: &str, payload: Value, reference: Option<&str>) -> PhoenixFrame {
        PhoenixFrame {
            topic: topic.to_owned(),
            event: event.to_owned(),
            payload,
            reference: reference.map(str::to_owned),
        }
    }

    fn record(id: i64, content: &str) -> Value {
        json!({
            "id": id,
            "username": "bob",
            "content": content,
            "created_at": "2024-01-01T00:00:00+00:00"
        })
    }

    #[test]
    fn join_frame_subscribes_to_inserts() {
        let encoded = serde_json::to_value(join_frame("messages", "1")).expect("encode");
        assert_eq!(encoded["topic"], "realtime:public:messages");
        assert_eq!(encoded["event"], "phx_join");
        assert_eq!(encoded["ref"], "1");
        assert_eq!(
            encoded["payload"]["config"]["postgres_changes"][0],
            json!({ "event": "INSERT", "schema": "public", "table": "messages" })
        );
    }

    #[test]
    fn classifies_join_replies_by_reference() {
        let topic = channel_topic("messages");
        let ok = frame(&topic, "phx_reply", json!({"status": "ok", "response": {}}), Some("1"));
        assert_eq!(classify_frame(&ok, &topic, "1"), Inbound::JoinAccepted);

        let heartbeat_reply = frame(&topic, "phx_reply", json!({"status": "ok"}), Some("7"));
        assert_eq!(classify_frame(&heartbeat_reply, &topic, "1"), Inbound::Ignored);

        let rejected = frame(
            &topic,
            "phx_reply",
            json!({"status": "error", "response": {"reason": "unmatched topic"}}),
            Some("1"),
        );
        assert_eq!(
            classify_frame(&rejected, &topic, "1"),
            Inbound::JoinRejected("unmatched topic".to_owned())
        );
    }

    #[test]
    fn decodes_both_insert_shapes() {
        let topic = channel_topic("messages");
        let current = frame(
            &topic,
            "postgres_changes",
            json!({"ids": [1], "data": {"type": "INSERT", "schema": "public", "record": record(1, "hi")}}),
            None,
        );
        let legacy = frame(
            &topic,
            "INSERT",
            json!({"type": "INSERT", "record": record(2, "yo")}),
            None,
        );

        match classify_frame(&current, &topic, "1") {
            Inbound::Inserted(message) => {
                assert_eq!(message.id, "1");
                assert_eq!(message.content, "hi");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
        match classify_frame(&legacy, &topic, "1") {
            Inbound::Inserted(message) => assert_eq!(message.id, "2"),
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn other_frames_are_ignored_or_flagged() {
        let topic = channel_topic("messages");
        let update = frame(
            &topic,
            "postgres_changes",
            json!({"data": {"type": "UPDATE", "record": record(1, "x")}}),
            None,
        );
        assert_eq!(classify_frame(&update, &topic, "1"), Inbound::Ignored);

        let foreign = frame("realtime:public:other", "INSERT", json!({"record": record(3, "z")}), None);
        assert_eq!(classify_frame(&foreign, &topic, "1"), Inbound::Ignored);

        let broken = frame(&topic, "INSERT", json!({"record": {"id": 4}}), None);
        assert!(matches!(
            classify_frame(&broken, &topic, "1"),
            Inbound::Malformed(_)
        ));

        let closed = frame(&topic, "phx_error", json!({}), None);
        assert!(matches!(
            classify_frame(&closed, &topic, "1"),
            Inbound::ChannelClosed(_)
        ));
    }

    /// Minimal Phoenix server: accepts each connection, replies ok to the join, then sends
    /// whatever the test pushes for that connection and closes it when the sender drops.
    async fn spawn_fake_realtime() -> (String, mpsc::Receiver<mpsc::Sender<Option<Value>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let (connections_tx, connections_rx) = mpsc::channel(4);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let connections_tx = connections_tx.clone();
                tokio::spawn(async move {
                    let Ok(socket) = accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = socket.split();
                    let join = loop {
                        match read.next().await {
                            Some(Ok(WsMessage::Text(text))) => {
                                let frame: PhoenixFrame =
                                    serde_json::from_str(&text).expect("client frame");
                                if frame.event == "phx_join" {
                                    break frame;
                                }
                            }
                            _ => return,
                        }
                    };
                    let reply = frame(
                        &join.topic,
                        "phx_reply",
                        json!({"status": "ok", "response": {}}),
                        join.reference.as_deref(),
                    );
                    let encoded = serde_json::to_string(&reply).expect("encode");
                    if write.send(WsMessage::Text(encoded.into())).await.is_err() {
                        return;
                    }

                    let (push_tx, mut push_rx) = mpsc::channel::<Option<Value>>(8);
                    if connections_tx.send(push_tx).await.is_err() {
                        return;
                    }
                    while let Some(Some(record)) = push_rx.recv().await {
                        let insert = frame(
                            &join.topic,
                            "postgres_changes",
                            json!({"data": {"type": "INSERT", "record": record}}),
                            None,
                        );
                        let encoded = serde_json::to_string(&insert).expect("encode");
                        if write.send(WsMessage::Text(encoded.into())).await.is_err() {
                            return;
                        }
                    }
                    let _ = write.close().await;
                });
            }
        });

        (format!("ws://{address}/realtime/v1/websocket"), connections_rx)
    }

    async fn next_event(subscription: &mut Subscription) -> SubscriptionEvent {
        timeout(Duration::from_secs(3), subscription.recv())
            .await
            .expect("event timeout")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn streams_inserts_and_resumes_after_drop() {
        let (endpoint, mut connections) = spawn_fake_realtime().await;
        let mut config = SupabaseConfig::new("xyz.supabase.co", "anon")
            .expect("config")
            .with_realtime_endpoint(&endpoint)
            .expect("endpoint");
        config.reconnect_policy = backend_core::RetryPolicy::new(10, 50);

        let (feed, subscription) = Subscription::channel(16);
        let task = tokio::spawn(run_subscription(Arc::new(config), feed));
        let mut subscription = subscription.with_task(task);

        assert_eq!(
            next_event(&mut subscription).await,
            SubscriptionEvent::Ready { resumed: false }
        );
        let first = timeout(Duration::from_secs(3), connections.recv())
            .await
            .expect("connection timeout")
            .expect("connection");
        first.send(Some(record(1, "hi"))).await.expect("push");
        match next_event(&mut subscription).await {
            SubscriptionEvent::Inserted(message) => assert_eq!(message.content, "hi"),
            other => panic!("unexpected event: {other:?}"),
        }

        first.send(None).await.expect("close");
        match next_event(&mut subscription).await {
            SubscriptionEvent::Dropped { error, retry_in } => {
                assert_eq!(error.code, "subscription_dropped");
                assert!(retry_in.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            next_event(&mut subscription).await,
            SubscriptionEvent::Ready { resumed: true }
        );

        subscription.unsubscribe();
    }

    #[tokio::test]
    async fn unreachable_endpoint_reports_drops_with_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr");
        drop(listener);

        let mut config = SupabaseConfig::new("xyz.supabase.co", "anon")
            .expect("config")
            .with_realtime_endpoint(&format!("ws://{address}/realtime/v1/websocket"))
            .expect("endpoint");
        config.reconnect_policy = backend_core::RetryPolicy::new(10, 40);

        let (feed, subscription) = Subscription::channel(16);
        let task = tokio::spawn(run_subscription(Arc::new(config), feed));
        let mut subscription = subscription.with_task(task);

        let mut delays = Vec::new();
        for _ in 0..3 {
            match next_event(&mut subscription).await {
                SubscriptionEvent::Dropped { error, retry_in } => {
                    assert_eq!(error.category, BackendErrorCategory::Network);
                    delays.push(retry_in.expect("retry hint").as_millis() as u64);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(delays, vec![10, 20, 40]);
    }
}
