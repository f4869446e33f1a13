use std::{sync::Arc, time::Duration};

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};

use bcon_hub::{config::Config, startup, unix_now};
use proto::Role;
use proto::token::{mint_adapter, mint_client};

const ADAPTER_SECRET: &str = "adapter-secret-adapter-secret-xx";
const CLIENT_SECRET: &str = "client-secret-client-secret-xxxx";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub(adapter_port: u16, client_port: u16, tweak: impl FnOnce(&mut Config)) {
    let mut config = Config {
        adapter_port,
        client_port,
        adapter_secret: ADAPTER_SECRET.to_string(),
        client_secret: CLIENT_SECRET.to_string(),
        heartbeat_interval_seconds: 1,
        connection_timeout_seconds: 5,
        ack_timeout_seconds: 2,
        ..Config::default()
    };
    tweak(&mut config);

    tokio::spawn(async move {
        startup(Arc::new(config)).await.unwrap();
    });

    sleep(Duration::from_millis(300)).await;
}

async fn connect_adapter(port: u16, server_id: &str) -> Result<Socket> {
    let token = mint_adapter(ADAPTER_SECRET, None, server_id, None, unix_now() + 600).unwrap();
    let mut request = format!("ws://127.0.0.1:{port}/").into_client_request()?;
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {token}").parse()?);

    let (socket, _) = connect_async(request).await?;
    // Registration happens in the upgrade task; give it a beat so ordering
    // between connections is deterministic.
    sleep(Duration::from_millis(200)).await;
    Ok(socket)
}

async fn connect_client(port: u16, role: Option<Role>) -> Result<Socket> {
    let mut request = format!("ws://127.0.0.1:{port}/").into_client_request()?;
    if let Some(role) = role {
        let token = mint_client(CLIENT_SECRET, None, "u-test", role, None, unix_now() + 600).unwrap();
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {token}").parse()?);
    }

    let (socket, _) = connect_async(request).await?;
    sleep(Duration::from_millis(200)).await;
    Ok(socket)
}

async fn send_json(socket: &mut Socket, value: Value) -> Result<()> {
    socket.send(Message::Text(value.to_string())).await?;
    Ok(())
}

/// Next text envelope, skipping control frames.
async fn next_envelope(socket: &mut Socket, secs: u64) -> Result<Value> {
    let deadline = Duration::from_secs(secs);
    loop {
        let message = timeout(deadline, socket.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
        if let Message::Text(text) = message {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

/// Assert that no text envelope arrives inside the window.
async fn expect_silence(socket: &mut Socket, millis: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected envelope: {text}"),
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return,
        }
    }
}

#[tokio::test]
async fn guest_cannot_command_but_stays_connected() -> Result<()> {
    start_hub(9101, 9102, |_| {}).await;

    let mut guest = connect_client(9102, None).await?;
    send_json(
        &mut guest,
        json!({
            "eventType": "execute_command",
            "messageId": "m-1",
            "data": { "command": "op alice", "server_id": "s1" },
        }),
    )
    .await?;

    let reply = next_envelope(&mut guest, 3).await?;
    assert_eq!(reply["eventType"], "error");
    assert_eq!(reply["data"]["kind"], "forbidden_role");
    assert_eq!(reply["replyTo"], "m-1");

    // The session is still open and serviceable.
    send_json(&mut guest, json!({ "eventType": "get_server_info" })).await?;
    let info = next_envelope(&mut guest, 3).await?;
    assert_eq!(info["eventType"], "server_info");
    assert!(info["data"]["servers"].is_array());

    Ok(())
}

#[tokio::test]
async fn adapter_displacement_closes_the_older_connection() -> Result<()> {
    start_hub(9111, 9112, |_| {}).await;

    let mut first = connect_adapter(9111, "s1").await?;
    let _second = connect_adapter(9111, "s1").await?;

    let deadline = Duration::from_secs(3);
    loop {
        let message = timeout(deadline, first.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream ended without close frame"))??;
        if let Message::Close(frame) = message {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 1001);
            assert_eq!(frame.reason, "server_displaced");
            break;
        }
    }

    Ok(())
}

#[tokio::test]
async fn silent_client_times_out_with_heartbeat_close() -> Result<()> {
    start_hub(9171, 9172, |_| {}).await;

    let mut client = connect_client(9172, None).await?;

    // Pongs only go out when the client polls its socket; staying away
    // from the stream past connection_timeout_seconds means the hub never
    // sees one and closes the session.
    sleep(Duration::from_secs(7)).await;

    let deadline = Duration::from_secs(3);
    loop {
        let message = timeout(deadline, client.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream ended without close frame"))??;
        if let Message::Close(frame) = message {
            let frame = frame.expect("close frame with code");
            assert_eq!(u16::from(frame.code), 1001);
            assert_eq!(frame.reason, "heartbeat_timeout");
            break;
        }
    }

    Ok(())
}

#[tokio::test]
async fn ack_round_trip_without_synthetic_timeout() -> Result<()> {
    start_hub(9121, 9122, |_| {}).await;

    let mut adapter = connect_adapter(9121, "s1").await?;
    let mut admin = connect_client(9122, Some(Role::Admin)).await?;

    send_json(
        &mut admin,
        json!({
            "eventType": "execute_command",
            "messageId": "m-1",
            "requiresAck": true,
            "data": { "command": "say hi", "server_id": "s1" },
        }),
    )
    .await?;

    // The adapter sees the command verbatim.
    let command = next_envelope(&mut adapter, 3).await?;
    assert_eq!(command["eventType"], "execute_command");
    assert_eq!(command["messageId"], "m-1");
    assert_eq!(command["requiresAck"], true);
    assert_eq!(command["data"]["command"], "say hi");
    assert_eq!(command["data"]["server_id"], "s1");

    send_json(
        &mut adapter,
        json!({
            "eventType": "command_result",
            "replyTo": "m-1",
            "data": { "success": true, "result": "ok" },
        }),
    )
    .await?;

    let result = next_envelope(&mut admin, 3).await?;
    assert_eq!(result["eventType"], "command_result");
    assert_eq!(result["replyTo"], "m-1");
    assert_eq!(result["data"]["success"], true);

    // The ack resolved; no ack_timeout may follow after the deadline.
    expect_silence(&mut admin, 3000).await;

    Ok(())
}

#[tokio::test]
async fn ack_timeout_synthesized_when_adapter_stays_silent() -> Result<()> {
    start_hub(9161, 9162, |_| {}).await;

    let _adapter = connect_adapter(9161, "s1").await?;
    let mut admin = connect_client(9162, Some(Role::Admin)).await?;

    send_json(
        &mut admin,
        json!({
            "eventType": "execute_command",
            "messageId": "m-2",
            "requiresAck": true,
            "data": { "command": "say hi", "server_id": "s1" },
        }),
    )
    .await?;

    let reply = next_envelope(&mut admin, 5).await?;
    assert_eq!(reply["eventType"], "error");
    assert_eq!(reply["data"]["kind"], "ack_timeout");
    assert_eq!(reply["replyTo"], "m-2");

    Ok(())
}

#[tokio::test]
async fn broadcast_filtered_by_role() -> Result<()> {
    start_hub(9131, 9132, |_| {}).await;

    let mut adapter = connect_adapter(9131, "s1").await?;
    let mut admin = connect_client(9132, Some(Role::Admin)).await?;
    let mut guest = connect_client(9132, None).await?;

    send_json(
        &mut adapter,
        json!({
            "eventType": "custom_command_executed",
            "data": { "command": "/ban" },
        }),
    )
    .await?;

    let seen = next_envelope(&mut admin, 3).await?;
    assert_eq!(seen["eventType"], "custom_command_executed");
    // Stamped from the adapter's principal, not the payload.
    assert_eq!(seen["data"]["server_id"], "s1");

    expect_silence(&mut guest, 1500).await;

    Ok(())
}

#[tokio::test]
async fn rate_limit_denies_and_does_not_forward() -> Result<()> {
    start_hub(9141, 9142, |config| {
        config.rate_limits.player_requests_per_minute = 5;
    })
    .await;

    let mut adapter = connect_adapter(9141, "s1").await?;
    let mut player = connect_client(9142, Some(Role::Player)).await?;

    for n in 0..6 {
        send_json(
            &mut player,
            json!({
                "eventType": "send_chat",
                "messageId": format!("m-{n}"),
                "data": { "message": "hello", "server_id": "s1" },
            }),
        )
        .await?;
    }

    for _ in 0..5 {
        let forwarded = next_envelope(&mut adapter, 3).await?;
        assert_eq!(forwarded["eventType"], "send_chat");
    }
    expect_silence(&mut adapter, 1000).await;

    let denied = next_envelope(&mut player, 3).await?;
    assert_eq!(denied["eventType"], "error");
    assert_eq!(denied["data"]["kind"], "rate_limited");

    Ok(())
}

#[tokio::test]
async fn health_endpoint_reports_status() -> Result<()> {
    start_hub(9151, 9152, |_| {}).await;

    let mut stream = TcpStream::connect(("127.0.0.1", 9152)).await?;
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"ok\""));
    assert!(response.contains("\"version\""));

    Ok(())
}
