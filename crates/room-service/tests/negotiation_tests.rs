//! Negotiation integration tests.
//!
//! Exercises the HTTP negotiation calls through `HttpRoomApi` against a
//! `TestRoomServer`, with peers registered over raw signaling sockets.

use futures::StreamExt;
use room_client::{ClientConfig, ClientError, HttpRoomApi, RoomApi};
use room_service::engine::EngineCounts;
use room_test_utils::TestRoomServer;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use common::types::{ControlAction, Direction, EntityKind, MediaKind, PeerId, ProducerId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn opus() -> Value {
    json!({"codecs": [{"mimeType": "audio/opus", "clockRate": 48000, "channels": 2}]})
}

fn api(server: &TestRoomServer) -> Result<HttpRoomApi, anyhow::Error> {
    let config = ClientConfig::for_url(&server.url())?;
    Ok(HttpRoomApi::new(&config)?)
}

async fn next_json(socket: &mut Socket) -> Result<Option<Value>, anyhow::Error> {
    while let Some(message) = socket.next().await {
        if let Message::Text(text) = message? {
            return Ok(Some(serde_json::from_str(&text)?));
        }
    }
    Ok(None)
}

async fn join(server: &TestRoomServer) -> Result<(Socket, PeerId), anyhow::Error> {
    let (mut socket, _) = connect_async(server.ws_url()).await?;
    let welcome = tokio::time::timeout(Duration::from_secs(5), next_json(&mut socket))
        .await??
        .ok_or_else(|| anyhow::anyhow!("closed before welcome"))?;
    let id = welcome["socketId"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("welcome without socketId"))?;
    Ok((socket, PeerId::from(id)))
}

async fn ready_transport(
    api: &HttpRoomApi,
    peer: &PeerId,
    direction: Direction,
) -> Result<(), anyhow::Error> {
    api.create_transport(peer, direction).await?;
    api.connect_transport(peer, direction, &json!({"role": "auto"}))
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_capabilities_match_engine() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let caps = api(&server)?.get_capabilities().await?;

    let mimes: Vec<&str> = caps["codecs"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("codecs missing"))?
        .iter()
        .filter_map(|c| c["mimeType"].as_str())
        .collect();
    assert!(mimes.contains(&"audio/opus"));
    Ok(())
}

#[tokio::test]
async fn test_produce_announces_new_producer_before_reply() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;

    let (mut observer, _) = join(&server).await?;
    let (_producer_socket, producer_peer) = join(&server).await?;
    let joined = next_json(&mut observer).await?;
    assert_eq!(joined.map(|v| v["event"].clone()), Some(json!("peer-join")));

    ready_transport(&api, &producer_peer, Direction::Send).await?;
    let producer_id = api.produce(&producer_peer, MediaKind::Audio, &opus()).await?;

    let announced = tokio::time::timeout(Duration::from_secs(5), next_json(&mut observer))
        .await??
        .ok_or_else(|| anyhow::anyhow!("observer socket closed"))?;
    assert_eq!(announced["event"], "new-producer");
    assert_eq!(announced["socketId"], producer_peer.as_str());
    assert_eq!(announced["producerId"], producer_id.as_str());

    Ok(())
}

#[tokio::test]
async fn test_produce_without_send_transport_is_not_found() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;
    let (_socket, peer) = join(&server).await?;

    let err = api
        .produce(&peer, MediaKind::Audio, &opus())
        .await
        .err();
    assert!(matches!(err, Some(ClientError::NotFound(_))));
    assert_eq!(server.engine_counts().await, EngineCounts::default());
    Ok(())
}

#[tokio::test]
async fn test_unknown_peer_is_not_found() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let err = api(&server)?
        .create_transport(&PeerId::from("ghost"), Direction::Send)
        .await
        .err();
    assert!(matches!(err, Some(ClientError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_capability_mismatch_is_412() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;

    let (_a_socket, a) = join(&server).await?;
    let (_b_socket, b) = join(&server).await?;
    ready_transport(&api, &a, Direction::Send).await?;
    ready_transport(&api, &b, Direction::Recv).await?;
    let producer_id = api.produce(&a, MediaKind::Audio, &opus()).await?;

    let response = reqwest::Client::new()
        .post(format!("{}/transport_consume", server.url()))
        .json(&json!({
            "socketId": b.as_str(),
            "producerId": producer_id.as_str(),
            "rtpCapabilities": {"codecs": [{"kind": "video", "mimeType": "video/VP8"}]}
        }))
        .send()
        .await?;
    assert_eq!(response.status(), 412);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "UNSUPPORTED");

    assert_eq!(server.engine_counts().await.consumers, 0);
    Ok(())
}

#[tokio::test]
async fn test_consume_is_idempotent_per_producer() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;

    let (_a_socket, a) = join(&server).await?;
    let (_b_socket, b) = join(&server).await?;
    ready_transport(&api, &a, Direction::Send).await?;
    ready_transport(&api, &b, Direction::Recv).await?;
    let producer_id = api.produce(&a, MediaKind::Audio, &opus()).await?;

    let caps = api.get_capabilities().await?;
    let first = api.consume(&b, &producer_id, &caps).await?;
    let second = api.consume(&b, &producer_id, &caps).await?;

    assert_eq!(first.id, second.id);
    assert!(first.paused);
    assert_eq!(server.engine_counts().await.consumers, 1);
    Ok(())
}

#[tokio::test]
async fn test_consume_unknown_producer_is_not_found() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;
    let (_socket, peer) = join(&server).await?;
    ready_transport(&api, &peer, Direction::Recv).await?;

    let err = api
        .consume(&peer, &ProducerId::from("nope"), &json!({"codecs": []}))
        .await
        .err();
    assert!(matches!(err, Some(ClientError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_transport_replacement_closes_old_transport() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;
    let (_socket, peer) = join(&server).await?;

    let first = api.create_transport(&peer, Direction::Send).await?;
    let second = api.create_transport(&peer, Direction::Send).await?;

    assert_ne!(first.id, second.id);
    assert_eq!(server.engine_counts().await.transports, 1);
    Ok(())
}

#[tokio::test]
async fn test_control_resume_and_close_consumer() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;

    let (_a_socket, a) = join(&server).await?;
    let (_b_socket, b) = join(&server).await?;
    ready_transport(&api, &a, Direction::Send).await?;
    ready_transport(&api, &b, Direction::Recv).await?;
    let producer_id = api.produce(&a, MediaKind::Audio, &opus()).await?;
    let consumer = api
        .consume(&b, &producer_id, &api.get_capabilities().await?)
        .await?;

    api.control(&b, EntityKind::Consumer, consumer.id.as_str(), ControlAction::Resume)
        .await?;
    assert_eq!(server.engine_paused(consumer.id.as_str()).await, Some(false));

    // Only the owner may control it.
    let err = api
        .control(&a, EntityKind::Consumer, consumer.id.as_str(), ControlAction::Pause)
        .await
        .err();
    assert!(matches!(err, Some(ClientError::NotFound(_))));

    api.control(&b, EntityKind::Consumer, consumer.id.as_str(), ControlAction::Close)
        .await?;
    assert_eq!(server.engine_counts().await.consumers, 0);
    Ok(())
}

#[tokio::test]
async fn test_control_unknown_action_is_bad_request() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let (_socket, peer) = join(&server).await?;

    let response = reqwest::Client::new()
        .post(format!("{}/control", server.url()))
        .json(&json!({
            "socketId": peer.as_str(),
            "entityKind": "producer",
            "entityId": "p1",
            "action": "rewind"
        }))
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
    Ok(())
}

#[tokio::test]
async fn test_disconnect_releases_every_engine_entity() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;

    let (mut observer, observer_id) = join(&server).await?;
    let (leaver_socket, leaver) = join(&server).await?;
    ready_transport(&api, &observer_id, Direction::Recv).await?;
    ready_transport(&api, &leaver, Direction::Send).await?;
    ready_transport(&api, &leaver, Direction::Recv).await?;
    let producer_id = api.produce(&leaver, MediaKind::Audio, &opus()).await?;
    api.consume(&observer_id, &producer_id, &api.get_capabilities().await?)
        .await?;

    drop(leaver_socket);
    server.wait_for_room(|s| s.peers == 1).await?;

    // The observer's consumer of the departed producer goes with it.
    let expected = EngineCounts {
        transports: 1,
        producers: 0,
        consumers: 0,
    };
    server.wait_for_engine(|c| *c == expected).await?;

    let mut events = Vec::new();
    while let Ok(Ok(Some(frame))) =
        tokio::time::timeout(Duration::from_millis(300), next_json(&mut observer)).await
    {
        events.push(frame["event"].clone());
    }
    assert_eq!(
        events,
        vec![json!("peer-join"), json!("new-producer"), json!("peer-left")]
    );
    Ok(())
}

#[tokio::test]
async fn test_disconnect_between_transport_and_produce() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;

    let (mut observer, _) = join(&server).await?;
    let (leaver_socket, leaver) = join(&server).await?;
    ready_transport(&api, &leaver, Direction::Send).await?;

    drop(leaver_socket);
    server.wait_for_room(|s| s.peers == 1).await?;

    let err = api.produce(&leaver, MediaKind::Audio, &opus()).await.err();
    assert!(matches!(err, Some(ClientError::NotFound(_))));
    server
        .wait_for_engine(|c| *c == EngineCounts::default())
        .await?;

    let mut events = Vec::new();
    while let Ok(Ok(Some(frame))) =
        tokio::time::timeout(Duration::from_millis(300), next_json(&mut observer)).await
    {
        events.push(frame["event"].clone());
    }
    assert_eq!(events, vec![json!("peer-join"), json!("peer-left")]);
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_sockets_and_releases_engine() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let api = api(&server)?;

    let (mut a_socket, a) = join(&server).await?;
    let (_b_socket, b) = join(&server).await?;
    ready_transport(&api, &a, Direction::Send).await?;
    ready_transport(&api, &b, Direction::Recv).await?;
    let producer_id = api.produce(&a, MediaKind::Audio, &opus()).await?;
    api.consume(&b, &producer_id, &api.get_capabilities().await?)
        .await?;

    assert_eq!(server.shutdown().await?, 2);
    assert_eq!(server.engine_counts().await, EngineCounts::default());

    // The socket is closed by the server after the frames already queued.
    let mut events = Vec::new();
    let mut closed_by_server = false;
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_secs(5), a_socket.next()).await
    {
        match message {
            Ok(Message::Text(text)) => {
                let frame: Value = serde_json::from_str(&text)?;
                events.push(frame["event"].clone());
            }
            Ok(Message::Close(_)) => {
                closed_by_server = true;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(closed_by_server);
    assert_eq!(events, vec![json!("peer-join")]);
    Ok(())
}
