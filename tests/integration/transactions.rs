//! Integration tests for the Matrix side of the bridge.
//!
//! The transaction receiver runs on a local port with its writer connected
//! to a fake ICB server; `reqwest` plays the home server.

use std::sync::Arc;
use std::time::Duration;

use icb_bridge::link::{self, LinkWriter};
use icb_bridge::read_loop;
use icb_bridge::transactions::{self, BridgeState, EchoPolicy};
use icb_proto::packet::{self, CommandCode, FrameReader, Packet};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Server end of a bridge connection.
struct FakeServer {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeServer {
    async fn send(&mut self, packet: &Packet) {
        self.writer
            .write_all(&packet::encode(packet).unwrap())
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Packet {
        let payload = tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
            .await
            .expect("recv timed out")
            .unwrap();
        packet::decode(&payload).unwrap()
    }

    /// Receives one open message and returns its text.
    async fn recv_open(&mut self) -> String {
        let packet = self.recv().await;
        assert_eq!(packet.code(), CommandCode::Open);
        packet.join_from(1)
    }
}

/// A running bridge: fake ICB server plus transaction receiver.
struct Bridge {
    base_url: String,
    server: FakeServer,
    reader: Option<FrameReader<OwnedReadHalf>>,
    writer: LinkWriter,
    client: reqwest::Client,
}

impl Bridge {
    async fn start(configure: impl FnOnce(BridgeState) -> BridgeState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (group, accepted) = tokio::join!(link::connect(&addr), listener.accept());
        let group = group.unwrap();
        let (stream, _) = accepted.unwrap();
        let (read_half, write_half) = stream.into_split();

        let state = Arc::new(configure(BridgeState::new(group.writer.clone(), "@icb.")));
        let (http_addr, _handle) = transactions::start_server("127.0.0.1:0", state)
            .await
            .unwrap();

        Self {
            base_url: format!("http://{http_addr}"),
            server: FakeServer {
                reader: FrameReader::new(read_half),
                writer: write_half,
            },
            reader: Some(group.reader),
            writer: group.writer,
            client: reqwest::Client::new(),
        }
    }

    async fn put_txn(&self, txn_id: &str, body: &Value) -> reqwest::Response {
        self.client
            .put(format!("{}/transactions/{txn_id}", self.base_url))
            .json(body)
            .send()
            .await
            .unwrap()
    }
}

fn message(sender: &str, body: &str) -> Value {
    json!({
        "event_id": format!("${body}"),
        "type": "m.room.message",
        "room_id": "!room:example.org",
        "user_id": sender,
        "content": {"body": body, "msgtype": "m.text"}
    })
}

fn txn(events: &[Value]) -> Value {
    json!({ "events": events })
}

#[tokio::test]
async fn room_message_is_relayed_to_group() {
    let mut bridge = Bridge::start(|s| s).await;

    let body = json!({"events":[{"type":"room.message","content":{"body":"hello"},"user_id":"@alice:example.org"}]});
    let response = bridge.put_txn("1", &body).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({}));
    assert_eq!(bridge.server.recv().await, Packet::open("hello"));
}

#[tokio::test]
async fn batch_order_is_preserved() {
    let mut bridge = Bridge::start(|s| s).await;

    let body = txn(&[
        message("@alice:example.org", "one"),
        message("@bob:example.org", "two"),
        message("@carol:example.org", "three"),
    ]);
    assert_eq!(bridge.put_txn("1", &body).await.status(), StatusCode::OK);

    assert_eq!(bridge.server.recv_open().await, "one");
    assert_eq!(bridge.server.recv_open().await, "two");
    assert_eq!(bridge.server.recv_open().await, "three");
}

#[tokio::test]
async fn matrix_v1_path_accepts_post() {
    let mut bridge = Bridge::start(|s| s).await;

    let response = bridge
        .client
        .post(format!("{}/_matrix/app/v1/transactions/7", bridge.base_url))
        .json(&txn(&[message("@alice:example.org", "via v1")]))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(bridge.server.recv_open().await, "via v1");
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let mut bridge = Bridge::start(|s| s).await;

    let response = bridge
        .client
        .put(format!("{}/transactions/1", bridge.base_url))
        .body("{\"events\": [")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: Value = response.json().await.unwrap();
    assert_eq!(error["errcode"], "M_NOT_JSON");

    // The rejected id is not remembered; nothing was written before this.
    let response = bridge
        .put_txn("1", &txn(&[message("@alice:example.org", "after")]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(bridge.server.recv_open().await, "after");
}

#[tokio::test]
async fn retried_transaction_is_relayed_once() {
    let mut bridge = Bridge::start(|s| s).await;

    let first = txn(&[message("@alice:example.org", "first")]);
    assert_eq!(bridge.put_txn("5", &first).await.status(), StatusCode::OK);
    assert_eq!(bridge.put_txn("5", &first).await.status(), StatusCode::OK);
    let second = txn(&[message("@alice:example.org", "second")]);
    assert_eq!(bridge.put_txn("6", &second).await.status(), StatusCode::OK);

    assert_eq!(bridge.server.recv_open().await, "first");
    assert_eq!(bridge.server.recv_open().await, "second");
}

#[tokio::test]
async fn timed_out_transaction_still_relays_every_event() {
    let (writer, mut queue) = LinkWriter::channel(4);
    let state = Arc::new(BridgeState::new(writer, "@icb."));
    let (http_addr, _handle) = transactions::start_server("127.0.0.1:0", state)
        .await
        .unwrap();
    let url = format!("http://{http_addr}/transactions/T1");
    let body = txn(&[
        message("@alice:example.org", "a"),
        message("@alice:example.org", "b"),
    ]);
    let client = reqwest::Client::new();

    // Nothing completes the first write until the request has given up.
    let first = client
        .put(&url)
        .json(&body)
        .timeout(Duration::from_millis(200))
        .send()
        .await;
    assert!(first.unwrap_err().is_timeout());

    let mut written = Vec::new();
    for _ in 0..2 {
        let outbound = tokio::time::timeout(Duration::from_secs(5), queue.recv())
            .await
            .expect("relay stopped after the request was dropped")
            .unwrap();
        written.push(outbound.packet().unwrap().join_from(1));
        outbound.complete(Ok(()));
    }
    assert_eq!(written, ["a", "b"]);

    let retry = client.put(&url).json(&body).send().await.unwrap();
    assert_eq!(retry.status(), StatusCode::OK);
    assert!(queue.try_recv().is_err());
}

#[tokio::test]
async fn multiline_body_is_sent_as_one_message() {
    let mut bridge = Bridge::start(|s| s).await;

    let body = txn(&[
        message("@alice:example.org", "hi\nthere"),
        message("@alice:example.org", ""),
        message("@alice:example.org", "next"),
    ]);
    assert_eq!(bridge.put_txn("1", &body).await.status(), StatusCode::OK);

    assert_eq!(bridge.server.recv().await, Packet::open("hi\nthere"));
    assert_eq!(bridge.server.recv_open().await, "next");
}

#[tokio::test]
async fn bridge_event_halts_the_transaction() {
    let mut bridge = Bridge::start(|s| s).await;

    let body = txn(&[
        message("@alice:example.org", "a"),
        message("@icb.bob:example.org", "b"),
        message("@alice:example.org", "c"),
    ]);
    assert_eq!(bridge.put_txn("1", &body).await.status(), StatusCode::OK);
    let next = txn(&[message("@alice:example.org", "d")]);
    assert_eq!(bridge.put_txn("2", &next).await.status(), StatusCode::OK);

    assert_eq!(bridge.server.recv_open().await, "a");
    assert_eq!(bridge.server.recv_open().await, "d");
}

#[tokio::test]
async fn bridge_event_skipped_with_skip_policy() {
    let mut bridge = Bridge::start(|s| s.with_echo_policy(EchoPolicy::SkipEvent)).await;

    let body = txn(&[
        message("@alice:example.org", "a"),
        message("@icb.bob:example.org", "b"),
        message("@alice:example.org", "c"),
    ]);
    assert_eq!(bridge.put_txn("1", &body).await.status(), StatusCode::OK);

    assert_eq!(bridge.server.recv_open().await, "a");
    assert_eq!(bridge.server.recv_open().await, "c");
}

#[tokio::test]
async fn unknown_event_types_are_ignored() {
    let mut bridge = Bridge::start(|s| s).await;

    let body = txn(&[
        json!({"type": "m.room.member", "user_id": "@alice:example.org", "content": {"membership": "join"}}),
        json!({"type": "m.room.message", "user_id": "@alice:example.org", "content": {"body": 3}}),
        message("@alice:example.org", "real"),
    ]);
    assert_eq!(bridge.put_txn("1", &body).await.status(), StatusCode::OK);

    assert_eq!(bridge.server.recv_open().await, "real");
}

#[tokio::test]
async fn hs_token_is_enforced() {
    let mut bridge = Bridge::start(|s| s.with_hs_token("secret")).await;
    let body = txn(&[message("@alice:example.org", "authorized")]);
    let url = format!("{}/transactions/1", bridge.base_url);

    let missing = bridge.client.put(&url).json(&body).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = bridge
        .client
        .put(format!("{url}?access_token=nope"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);
    let error: Value = wrong.json().await.unwrap();
    assert_eq!(error["errcode"], "M_FORBIDDEN");

    let query = bridge
        .client
        .put(format!("{url}?access_token=secret"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(query.status(), StatusCode::OK);

    let bearer = bridge
        .client
        .put(format!("{}/transactions/2", bridge.base_url))
        .bearer_auth("secret")
        .json(&txn(&[message("@alice:example.org", "bearer")]))
        .send()
        .await
        .unwrap();
    assert_eq!(bearer.status(), StatusCode::OK);

    assert_eq!(bridge.server.recv_open().await, "authorized");
    assert_eq!(bridge.server.recv_open().await, "bearer");
}

#[tokio::test]
async fn relays_and_keepalives_share_the_link() {
    let mut bridge = Bridge::start(|s| s).await;
    let reader = bridge.reader.take().unwrap();
    let _read_task = read_loop::spawn(reader, bridge.writer.clone());

    // Pings arrive from the group while room messages are relayed.
    let ping = Packet::new(CommandCode::Ping, std::iter::empty::<String>());
    for i in 0..5 {
        bridge.server.send(&ping).await;
        let body = txn(&[message("@alice:example.org", &format!("m{i}"))]);
        assert_eq!(
            bridge.put_txn(&i.to_string(), &body).await.status(),
            StatusCode::OK
        );
    }

    let mut pongs = 0;
    let mut texts = Vec::new();
    for _ in 0..10 {
        let packet = bridge.server.recv().await;
        match packet.code() {
            CommandCode::Pong => pongs += 1,
            CommandCode::Open => texts.push(packet.join_from(1)),
            other => panic!("unexpected packet code {other}"),
        }
    }
    assert_eq!(pongs, 5);
    assert_eq!(texts, ["m0", "m1", "m2", "m3", "m4"]);
}
