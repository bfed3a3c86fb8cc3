//! Relay sessions between a real client, the relay server and a fake provider.

use std::net::SocketAddr;
use std::time::Duration;

use companion_link::config::RelayConfig;
use companion_link::relay::ProxyEvent;
use companion_link::server::{AppState, serve};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the fake provider saw during the handshake.
#[derive(Debug)]
struct Handshake {
    uri: String,
    protocols: String,
}

#[derive(Clone, Copy)]
enum ProviderMode {
    /// Record every frame and answer text with `echo:<text>`.
    Echo,
    /// Close right after the handshake.
    CloseWith(u16, &'static str),
}

struct Provider {
    addr: SocketAddr,
    handshakes: mpsc::UnboundedReceiver<Handshake>,
    received: mpsc::UnboundedReceiver<Message>,
}

async fn spawn_provider(mode: ProviderMode) -> Provider {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (handshake_tx, handshakes) = mpsc::unbounded_channel();
    let (received_tx, received) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handshake_tx = handshake_tx.clone();
            let received_tx = received_tx.clone();
            tokio::spawn(async move {
                let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                    let protocols = req
                        .headers()
                        .get(SEC_WEBSOCKET_PROTOCOL)
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let _ = handshake_tx.send(Handshake {
                        uri: req.uri().to_string(),
                        protocols,
                    });
                    resp.headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("realtime"));
                    Ok(resp)
                };
                let mut ws = accept_hdr_async(stream, callback).await.unwrap();

                if let ProviderMode::CloseWith(code, reason) = mode {
                    let _ = ws
                        .close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        }))
                        .await;
                }

                while let Some(Ok(message)) = ws.next().await {
                    let _ = received_tx.send(message.clone());
                    match message {
                        Message::Text(text) => {
                            let reply = format!("echo:{}", text.as_str());
                            if ws.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    Provider {
        addr,
        handshakes,
        received,
    }
}

async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, AppState::new(config), std::future::pending()));
    addr
}

fn relay_config(upstream: SocketAddr, api_key: &str) -> RelayConfig {
    RelayConfig {
        upstream_url: format!("ws://{upstream}/v1/realtime?model=test"),
        api_key: Some(api_key.to_string()),
        ..RelayConfig::default()
    }
}

async fn connect_client(relay: SocketAddr) -> Client {
    let mut request = format!("ws://{relay}/realtime").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("realtime"));
    let (client, _) = connect_async(request).await.unwrap();
    client
}

async fn recv(client: &mut Client) -> Message {
    tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("socket error")
}

async fn recv_proxy_event(client: &mut Client) -> ProxyEvent {
    match recv(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a proxy event, got {other:?}"),
    }
}

async fn expect_normal_close(client: &mut Client) {
    match recv(client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected a close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn early_frames_reach_upstream_in_order() {
    let mut provider = spawn_provider(ProviderMode::Echo).await;
    let relay = spawn_relay(relay_config(provider.addr, "sk-test_123")).await;

    let mut client = connect_client(relay).await;
    for text in ["a", "b", "c"] {
        client.send(Message::Text(text.into())).await.unwrap();
    }

    for text in ["a", "b", "c"] {
        match recv(&mut client).await {
            Message::Text(reply) => assert_eq!(reply.as_str(), format!("echo:{text}")),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    let mut upstream_frames = Vec::new();
    for _ in 0..3 {
        upstream_frames.push(provider.received.recv().await.unwrap());
    }
    assert_eq!(
        upstream_frames,
        vec![
            Message::Text("a".into()),
            Message::Text("b".into()),
            Message::Text("c".into()),
        ]
    );

    let handshake = provider.handshakes.recv().await.unwrap();
    assert_eq!(
        handshake.protocols,
        "realtime, openai-insecure-api-key.sk-test_123, openai-beta.realtime-v1"
    );
    assert_eq!(handshake.uri, "/v1/realtime?model=test");
}

#[tokio::test]
async fn binary_frames_are_relayed_verbatim() {
    let mut provider = spawn_provider(ProviderMode::Echo).await;
    let relay = spawn_relay(relay_config(provider.addr, "sk-test")).await;

    let mut client = connect_client(relay).await;
    let payload = vec![0_u8, 159, 146, 150, 255];
    client
        .send(Message::Binary(payload.clone().into()))
        .await
        .unwrap();

    let received = provider.received.recv().await.unwrap();
    assert_eq!(received, Message::Binary(payload.into()));
}

#[tokio::test]
async fn client_close_closes_upstream_normally() {
    let mut provider = spawn_provider(ProviderMode::Echo).await;
    let relay = spawn_relay(relay_config(provider.addr, "sk-test")).await;

    let mut client = connect_client(relay).await;
    client.send(Message::Text("hello".into())).await.unwrap();
    assert!(matches!(recv(&mut client).await, Message::Text(_)));

    client.close(None).await.unwrap();

    let mut close_code = None;
    while let Some(message) = provider.received.recv().await {
        if let Message::Close(frame) = message {
            close_code = frame.map(|frame| frame.code);
            break;
        }
        assert_eq!(message, Message::Text("hello".into()));
    }
    assert_eq!(close_code, Some(CloseCode::Normal));
}

#[tokio::test]
async fn upstream_close_is_reported_then_client_closed() {
    let provider = spawn_provider(ProviderMode::CloseWith(4000, "session expired")).await;
    let relay = spawn_relay(relay_config(provider.addr, "sk-test")).await;

    let mut client = connect_client(relay).await;
    assert_eq!(
        recv_proxy_event(&mut client).await,
        ProxyEvent::Closed {
            code: 4000,
            reason: "session expired".to_string()
        }
    );
    expect_normal_close(&mut client).await;
}

#[tokio::test]
async fn non_token_key_falls_back_to_query_parameter() {
    let mut provider = spawn_provider(ProviderMode::Echo).await;
    let relay = spawn_relay(relay_config(provider.addr, "not a token")).await;

    let _client = connect_client(relay).await;
    let handshake = tokio::time::timeout(Duration::from_secs(5), provider.handshakes.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(handshake.uri, "/v1/realtime?model=test&api_key=not+a+token");
    assert_eq!(handshake.protocols, "realtime, openai-beta.realtime-v1");
}

#[tokio::test]
async fn unreachable_upstream_is_reported_and_closed() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let relay = spawn_relay(relay_config(dead, "sk-test")).await;
    let mut client = connect_client(relay).await;

    assert!(matches!(
        recv_proxy_event(&mut client).await,
        ProxyEvent::Error { .. }
    ));
    assert_eq!(
        recv_proxy_event(&mut client).await,
        ProxyEvent::Closed {
            code: 1006,
            reason: "upstream connect failed".to_string()
        }
    );
    expect_normal_close(&mut client).await;
}
