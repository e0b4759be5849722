//! Signaling socket integration tests.
//!
//! Drives `/room` with a raw WebSocket client against `TestRoomServer` and
//! checks the welcome frame, join/leave announcements and unregistration.

use futures::{SinkExt, StreamExt};
use room_test_utils::TestRoomServer;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Next text frame as JSON, skipping control frames.
async fn next_json(socket: &mut Socket) -> Result<serde_json::Value, anyhow::Error> {
    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = socket.next().await {
            if let Message::Text(text) = message? {
                return Ok::<_, anyhow::Error>(Some(serde_json::from_str(&text)?));
            }
        }
        Ok(None)
    })
    .await??;
    frame.ok_or_else(|| anyhow::anyhow!("socket closed"))
}

/// Connect and return the socket with its welcomed id.
async fn join(server: &TestRoomServer) -> Result<(Socket, String), anyhow::Error> {
    let (mut socket, _) = connect_async(server.ws_url()).await?;
    let welcome = next_json(&mut socket).await?;
    assert_eq!(welcome["event"], "welcome");
    let id = welcome["socketId"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("welcome without socketId"))?
        .to_string();
    Ok((socket, id))
}

#[tokio::test]
async fn test_welcome_is_first_frame_with_fresh_id() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;

    let (_a, a_id) = join(&server).await?;
    let (_b, b_id) = join(&server).await?;

    assert!(!a_id.is_empty());
    assert_ne!(a_id, b_id);
    server.wait_for_room(|s| s.peers == 2).await?;

    Ok(())
}

#[tokio::test]
async fn test_join_and_leave_are_announced_to_others() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;

    let (mut a, _a_id) = join(&server).await?;
    let (mut b, b_id) = join(&server).await?;

    let joined = next_json(&mut a).await?;
    assert_eq!(joined["event"], "peer-join");
    assert_eq!(joined["socketId"], b_id.as_str());

    b.close(None).await?;

    let left = next_json(&mut a).await?;
    assert_eq!(left["event"], "peer-left");
    assert_eq!(left["socketId"], b_id.as_str());

    server.wait_for_room(|s| s.peers == 1).await?;
    Ok(())
}

#[tokio::test]
async fn test_peer_appears_in_snapshot_until_disconnect() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let client = reqwest::Client::new();

    let (mut socket, id) = join(&server).await?;
    let peers: serde_json::Value = client
        .get(format!("{}/peers", server.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(peers[0]["socketId"], id.as_str());
    assert_eq!(peers[0]["producers"], serde_json::json!([]));

    socket.close(None).await?;
    server.wait_for_room(|s| s.peers == 0).await?;

    let peers: serde_json::Value = client
        .get(format!("{}/peers", server.url()))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(peers, serde_json::json!([]));

    Ok(())
}

#[tokio::test]
async fn test_dropped_socket_unregisters_once() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;

    let (mut observer, _) = join(&server).await?;
    let (gone, gone_id) = join(&server).await?;
    let joined = next_json(&mut observer).await?;
    assert_eq!(joined["event"], "peer-join");

    // No close handshake: the server sees a read error or EOF.
    drop(gone);

    let left = next_json(&mut observer).await?;
    assert_eq!(left["event"], "peer-left");
    assert_eq!(left["socketId"], gone_id.as_str());

    // Nothing else follows for that peer.
    let (_late, late_id) = join(&server).await?;
    let next = next_json(&mut observer).await?;
    assert_eq!(next["event"], "peer-join");
    assert_eq!(next["socketId"], late_id.as_str());

    Ok(())
}

#[tokio::test]
async fn test_client_frames_are_ignored() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;

    let (mut socket, _) = join(&server).await?;
    socket.send(Message::Text("hello".to_string())).await?;
    socket.send(Message::Ping(vec![1, 2, 3])).await?;

    let (_other, other_id) = join(&server).await?;
    let joined = next_json(&mut socket).await?;
    assert_eq!(joined["socketId"], other_id.as_str());
    server.wait_for_room(|s| s.peers == 2).await?;

    Ok(())
}
