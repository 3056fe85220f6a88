// WebSocket transport for the signaling core.
//
// One task per socket. Inbound frames are decoded and dispatched inline;
// everything addressed to this connection arrives over an unbounded mpsc
// channel registered in the stream registry, and a select loop multiplexes
// the two with the server-side heartbeat.

pub mod protocol;

use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use lumicast_common::protocol::ws::{ClientMessage, ServerMessage};
use lumicast_common::types::ConnectionId;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::{request_id_from_headers_or_generate, with_request_id_scope};
use crate::hooks::{MetadataStore, RecordingStorage};
use crate::metrics::{self, SignalingMetrics};
use crate::presence::PresenceStore;
use crate::registry::StreamRegistry;
use crate::{broker, dispatch, lifecycle};

/// Shared handles threaded through every socket task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SignalingConfig>,
    pub registry: StreamRegistry,
    pub presence: PresenceStore,
    pub metadata: MetadataStore,
    pub storage: RecordingStorage,
    pub metrics: Arc<SignalingMetrics>,
}

impl AppState {
    pub fn new(config: SignalingConfig) -> Self {
        let presence = PresenceStore::memory(config.chat_rate_limit, config.chat_rate_window);
        Self {
            config: Arc::new(config),
            registry: StreamRegistry::default(),
            presence,
            metadata: MetadataStore::memory(),
            storage: RecordingStorage::memory(),
            metrics: Arc::new(SignalingMetrics::default()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(state)
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    let max_frame_bytes = state.config.max_frame_bytes;
    ws.max_frame_size(max_frame_bytes).on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(state, socket)).await;
    })
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket, max_frame_bytes: usize) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: format!("websocket frame exceeds maximum size of {max_frame_bytes} bytes")
                .into(),
        })))
        .await;
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let connection_id = ConnectionId::generate();
    let max_frame_bytes = state.config.max_frame_bytes;

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerMessage>();
    state.registry.register_connection(connection_id, outbound_sender).await;

    let connected = ServerMessage::Connected {
        connection_id,
        heartbeat_interval_ms: state.config.heartbeat_interval.as_millis() as u64,
    };
    if protocol::send_server_message(&mut socket, &connected).await.is_err() {
        state.registry.deregister_connection(connection_id).await;
        return;
    }
    info!(connection_id = %connection_id, "websocket connected");

    // Heartbeat: server pings on the configured cadence, disconnects when no
    // pong arrives within the timeout.
    let mut heartbeat_interval = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = state.config.heartbeat_timeout;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > state.config.heartbeat_interval + heartbeat_timeout {
                    warn!(connection_id = %connection_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(outbound_message) => {
                        if protocol::send_server_message(&mut socket, &outbound_message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > max_frame_bytes {
                            close_frame_too_large(&mut socket, max_frame_bytes).await;
                            break;
                        }

                        match protocol::decode_client_message(&raw_message) {
                            Ok(inbound) => {
                                let event = inbound.event_name();
                                let started_at = Instant::now();
                                dispatch_client_message(&state, connection_id, inbound).await;
                                metrics::record_ws_event(
                                    event,
                                    false,
                                    started_at.elapsed().as_millis() as u64,
                                );
                            }
                            Err(error) => {
                                // Malformed frames are logged and dropped;
                                // the connection stays up.
                                metrics::record_ws_event("invalid", true, 0);
                                warn!(
                                    connection_id = %connection_id,
                                    %error,
                                    "ignoring undecodable websocket frame"
                                );
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket, max_frame_bytes).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    lifecycle::handle_disconnect(&state, connection_id).await;
}

async fn dispatch_client_message(
    state: &AppState,
    connection_id: ConnectionId,
    message: ClientMessage,
) {
    match message {
        ClientMessage::Broadcaster { stream_id, info } => {
            if let Err(error) = stream_id.validate() {
                warn!(connection_id = %connection_id, %error, "dropping announce with invalid stream id");
                return;
            }
            broker::handle_announce(state, connection_id, stream_id, info).await;
        }
        ClientMessage::Watcher { stream_id } => {
            if let Err(error) = stream_id.validate() {
                warn!(connection_id = %connection_id, %error, "dropping watch request with invalid stream id");
                return;
            }
            broker::handle_watcher_request(state, connection_id, stream_id).await;
        }
        ClientMessage::Offer { to, sdp, .. } => {
            broker::handle_relay(state, connection_id, to, broker::RelayPayload::Offer(sdp)).await;
        }
        ClientMessage::Answer { to, sdp, .. } => {
            broker::handle_relay(state, connection_id, to, broker::RelayPayload::Answer(sdp))
                .await;
        }
        ClientMessage::Candidate { to, candidate, .. } => {
            broker::handle_relay(
                state,
                connection_id,
                to,
                broker::RelayPayload::Candidate(candidate),
            )
            .await;
        }
        ClientMessage::StreamEnded { stream_id, save_recording } => {
            if state.registry.is_broadcaster(&stream_id, connection_id).await {
                lifecycle::finalize_stream(state, stream_id, save_recording.unwrap_or(true))
                    .await;
            } else {
                debug!(
                    %stream_id,
                    connection_id = %connection_id,
                    "stream-ended from non-broadcaster dropped"
                );
            }
        }
        ClientMessage::VideoChunk { stream_id, chunk, chunk_index } => {
            dispatch::handle_video_chunk(state, connection_id, stream_id, chunk, chunk_index)
                .await;
        }
        ClientMessage::ShareDocument { stream_id, document } => {
            dispatch::handle_share_document(state, connection_id, stream_id, document).await;
        }
        ClientMessage::CloseDocument { stream_id } => {
            dispatch::handle_close_document(state, connection_id, stream_id).await;
        }
        ClientMessage::SyncDocuments { stream_id, documents } => {
            dispatch::handle_sync_documents(state, connection_id, stream_id, documents).await;
        }
        ClientMessage::SendChatMessage { stream_id, message } => {
            dispatch::handle_chat(state, connection_id, stream_id, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{router, AppState};
    use crate::config::SignalingConfig;
    use futures_util::{SinkExt, StreamExt};
    use lumicast_common::protocol::ws::{ClientMessage, ServerMessage};
    use lumicast_common::types::ConnectionId;
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{
        connect_async, tungstenite::Message as WsFrame, MaybeTlsStream, WebSocketStream,
    };

    type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    struct TestServer {
        addr: SocketAddr,
        state: AppState,
        task: tokio::task::JoinHandle<()>,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    async fn spawn_server(config: SignalingConfig) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let state = AppState::new(config);
        let app = router(state.clone());
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("signaling websocket server should run for test");
        });
        TestServer { addr, state, task }
    }

    async fn spawn_default_server() -> TestServer {
        spawn_server(SignalingConfig::default()).await
    }

    async fn connect(addr: SocketAddr) -> ClientSocket {
        let (socket, _) = connect_async(format!("ws://{addr}/v1/ws"))
            .await
            .expect("client should connect");
        socket
    }

    async fn ws_send(socket: &mut ClientSocket, message: &ClientMessage) {
        let raw = serde_json::to_string(message).expect("client message should serialize");
        socket.send(WsFrame::Text(raw.into())).await.expect("client message should send");
    }

    async fn ws_recv(socket: &mut ClientSocket) -> ServerMessage {
        loop {
            let next = timeout(Duration::from_secs(2), socket.next())
                .await
                .expect("timed out waiting for websocket frame");
            let frame =
                next.expect("websocket should remain open").expect("websocket frame should decode");

            match frame {
                WsFrame::Text(payload) => {
                    return serde_json::from_str::<ServerMessage>(&payload)
                        .expect("text frame should decode as server message");
                }
                WsFrame::Ping(payload) => {
                    socket.send(WsFrame::Pong(payload)).await.expect("pong should send");
                }
                WsFrame::Close(_) => panic!("websocket closed unexpectedly"),
                WsFrame::Binary(_) | WsFrame::Pong(_) | WsFrame::Frame(_) => {}
            }
        }
    }

    /// First frame after the upgrade; returns the server-assigned handle.
    async fn expect_connected(socket: &mut ClientSocket) -> ConnectionId {
        match ws_recv(socket).await {
            ServerMessage::Connected { connection_id, .. } => connection_id,
            other => panic!("expected connected frame, got {other:?}"),
        }
    }

    async fn recv_until<F>(socket: &mut ClientSocket, mut matches: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            let message = ws_recv(socket).await;
            if matches(&message) {
                return message;
            }
        }
    }

    fn announce(stream_id: &str, title: Option<&str>) -> ClientMessage {
        ClientMessage::Broadcaster {
            stream_id: stream_id.into(),
            info: title.map(|title| lumicast_common::types::StreamInfo {
                title: title.to_string(),
                description: None,
                category: None,
            }),
        }
    }

    #[tokio::test]
    async fn handshake_assigns_distinct_connection_handles() {
        let server = spawn_default_server().await;

        let mut first = connect(server.addr).await;
        let mut second = connect(server.addr).await;

        let first_id = match ws_recv(&mut first).await {
            ServerMessage::Connected { connection_id, heartbeat_interval_ms } => {
                assert_eq!(heartbeat_interval_ms, 15_000);
                connection_id
            }
            other => panic!("expected connected frame, got {other:?}"),
        };
        let second_id = expect_connected(&mut second).await;
        assert_ne!(first_id, second_id);
    }

    #[tokio::test]
    async fn announce_then_watch_delivers_membership_and_info() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        let watcher_id = expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", Some("Linear Algebra"))).await;

        // Availability ping reaches every connection, announcer included.
        assert_eq!(ws_recv(&mut broadcaster).await, ServerMessage::Broadcaster);
        assert_eq!(ws_recv(&mut watcher).await, ServerMessage::Broadcaster);

        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;

        match ws_recv(&mut broadcaster).await {
            ServerMessage::Watcher { id } => assert_eq!(id, watcher_id),
            other => panic!("expected watcher frame, got {other:?}"),
        }
        assert_eq!(ws_recv(&mut broadcaster).await, ServerMessage::ViewerCount { count: 1 });

        assert_eq!(ws_recv(&mut watcher).await, ServerMessage::ViewerCount { count: 1 });
        match ws_recv(&mut watcher).await {
            ServerMessage::LivestreamInfo { info } => assert_eq!(info.title, "Linear Algebra"),
            other => panic!("expected livestream-info frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn watching_an_unknown_stream_returns_not_found() {
        let server = spawn_default_server().await;

        let mut watcher = connect(server.addr).await;
        expect_connected(&mut watcher).await;

        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "no-such-stream".into() })
            .await;
        match ws_recv(&mut watcher).await {
            ServerMessage::StreamNotFound { stream_id } => {
                assert_eq!(stream_id.as_str(), "no-such-stream");
            }
            other => panic!("expected stream-not-found frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_watch_requests_do_not_inflate_the_count() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;

        // Both joins answer with a count; the second must still report one.
        let first =
            recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;
        assert_eq!(first, ServerMessage::ViewerCount { count: 1 });
        let second =
            recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;
        assert_eq!(second, ServerMessage::ViewerCount { count: 1 });
    }

    #[tokio::test]
    async fn self_watch_is_ignored_silently() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut broadcaster, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        // Probe with a guaranteed-answered request: the only reply must be
        // for the probe, proving the self-watch produced nothing.
        ws_send(&mut broadcaster, &ClientMessage::Watcher { stream_id: "probe-missing".into() })
            .await;

        let reply = recv_until(&mut broadcaster, |m| {
            !matches!(m, ServerMessage::Broadcaster)
        })
        .await;
        match reply {
            ServerMessage::StreamNotFound { stream_id } => {
                assert_eq!(stream_id.as_str(), "probe-missing");
            }
            other => panic!("expected stream-not-found probe reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn negotiation_messages_relay_verbatim_with_sender_handle() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        let broadcaster_id = expect_connected(&mut broadcaster).await;
        let watcher_id = expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;

        let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n"});
        ws_send(
            &mut watcher,
            &ClientMessage::Offer {
                to: broadcaster_id,
                stream_id: "stream-1".into(),
                sdp: sdp.clone(),
            },
        )
        .await;
        match recv_until(&mut broadcaster, |m| matches!(m, ServerMessage::Offer { .. })).await {
            ServerMessage::Offer { from, sdp: relayed } => {
                assert_eq!(from, watcher_id);
                assert_eq!(relayed, sdp);
            }
            other => panic!("expected relayed offer, got {other:?}"),
        }

        let answer = json!({"type": "answer", "sdp": "v=0\r\n"});
        ws_send(
            &mut broadcaster,
            &ClientMessage::Answer {
                to: watcher_id,
                stream_id: "stream-1".into(),
                sdp: answer.clone(),
            },
        )
        .await;
        match recv_until(&mut watcher, |m| matches!(m, ServerMessage::Answer { .. })).await {
            ServerMessage::Answer { from, sdp: relayed } => {
                assert_eq!(from, broadcaster_id);
                assert_eq!(relayed, answer);
            }
            other => panic!("expected relayed answer, got {other:?}"),
        }

        let candidate = json!({"candidate": "candidate:0 1 UDP 2122252543 192.0.2.1 54400 typ host"});
        ws_send(
            &mut watcher,
            &ClientMessage::Candidate {
                to: broadcaster_id,
                stream_id: "stream-1".into(),
                candidate: candidate.clone(),
            },
        )
        .await;
        match recv_until(&mut broadcaster, |m| matches!(m, ServerMessage::Candidate { .. })).await
        {
            ServerMessage::Candidate { from, candidate: relayed } => {
                assert_eq!(from, watcher_id);
                assert_eq!(relayed, candidate);
            }
            other => panic!("expected relayed candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chat_fans_out_to_everyone_and_rate_limits_the_sender() {
        let mut config = SignalingConfig::default();
        config.chat_rate_limit = 2;
        config.chat_rate_window = Duration::from_secs(60);
        let server = spawn_server(config).await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        let watcher_id = expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;

        for index in 0..3 {
            ws_send(
                &mut watcher,
                &ClientMessage::SendChatMessage {
                    stream_id: "stream-1".into(),
                    message: json!({"text": format!("message {index}")}),
                },
            )
            .await;
        }

        // Sender sees its two admitted messages, then the rejection.
        for index in 0..2 {
            match recv_until(&mut watcher, |m| matches!(m, ServerMessage::ChatMessage { .. }))
                .await
            {
                ServerMessage::ChatMessage { from, message, .. } => {
                    assert_eq!(from, watcher_id);
                    assert_eq!(message["text"], format!("message {index}"));
                }
                other => panic!("expected chat message, got {other:?}"),
            }
        }
        assert!(matches!(
            recv_until(&mut watcher, |m| !matches!(m, ServerMessage::ChatMessage { .. })).await,
            ServerMessage::RateLimitExceeded { .. }
        ));

        // The broadcaster only ever sees the admitted two.
        for _ in 0..2 {
            recv_until(&mut broadcaster, |m| matches!(m, ServerMessage::ChatMessage { .. })).await;
        }
        ws_send(
            &mut broadcaster,
            &ClientMessage::SendChatMessage {
                stream_id: "stream-1".into(),
                message: json!({"text": "probe"}),
            },
        )
        .await;
        match recv_until(&mut broadcaster, |m| matches!(m, ServerMessage::ChatMessage { .. }))
            .await
        {
            ServerMessage::ChatMessage { message, .. } => assert_eq!(message["text"], "probe"),
            other => panic!("expected probe chat message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shared_documents_reach_watchers_and_sync_on_request() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;

        let document = json!({"name": "notes.pdf", "url": "https://example.test/notes.pdf"});
        ws_send(
            &mut broadcaster,
            &ClientMessage::ShareDocument {
                stream_id: "stream-1".into(),
                document: document.clone(),
            },
        )
        .await;
        match recv_until(&mut watcher, |m| matches!(m, ServerMessage::ShareDocument { .. })).await
        {
            ServerMessage::ShareDocument { document: shared } => assert_eq!(shared, document),
            other => panic!("expected share-document frame, got {other:?}"),
        }

        // A watcher-initiated sync answers the requester with the stored list.
        ws_send(
            &mut watcher,
            &ClientMessage::SyncDocuments { stream_id: "stream-1".into(), documents: vec![] },
        )
        .await;
        match recv_until(&mut watcher, |m| matches!(m, ServerMessage::SyncDocuments { .. })).await
        {
            ServerMessage::SyncDocuments { documents } => {
                assert_eq!(documents, vec![document.clone()]);
            }
            other => panic!("expected sync-documents frame, got {other:?}"),
        }

        ws_send(&mut broadcaster, &ClientMessage::CloseDocument { stream_id: "stream-1".into() })
            .await;
        assert!(matches!(
            recv_until(&mut watcher, |m| matches!(m, ServerMessage::CloseDocument)).await,
            ServerMessage::CloseDocument
        ));
    }

    #[tokio::test]
    async fn stream_ended_uploads_recording_and_persists_metadata() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;

        // Presence registration is spawned off the join path; wait for it so
        // the post-finalize assertion observes a real release.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server
            .state
            .presence
            .viewer_count(&"stream-1".into())
            .await
            .expect("presence lookup should succeed")
            != 1
        {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for presence registration"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // AQID = [1, 2, 3], BAU= = [4, 5]; assembly follows arrival order.
        ws_send(
            &mut broadcaster,
            &ClientMessage::VideoChunk {
                stream_id: "stream-1".into(),
                chunk: "AQID".into(),
                chunk_index: 0,
            },
        )
        .await;
        ws_send(
            &mut broadcaster,
            &ClientMessage::VideoChunk {
                stream_id: "stream-1".into(),
                chunk: "BAU=".into(),
                chunk_index: 1,
            },
        )
        .await;
        ws_send(
            &mut broadcaster,
            &ClientMessage::StreamEnded {
                stream_id: "stream-1".into(),
                save_recording: Some(true),
            },
        )
        .await;

        match recv_until(&mut watcher, |m| matches!(m, ServerMessage::StreamEnded { .. })).await {
            ServerMessage::StreamEnded { stream_id } => {
                assert_eq!(stream_id.as_str(), "stream-1");
            }
            other => panic!("expected stream-ended frame, got {other:?}"),
        }

        // Upload and persistence are spawned off the socket path; poll.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let blob = server.state.storage.stored_blob(&"stream-1".into()).await;
            let record = server
                .state
                .metadata
                .find_stream(&"stream-1".into())
                .await
                .expect("metadata lookup should succeed");
            let viewers = server
                .state
                .presence
                .viewer_count(&"stream-1".into())
                .await
                .expect("presence lookup should succeed");
            let done = blob.as_deref() == Some(&[1, 2, 3, 4, 5][..])
                && record.as_ref().is_some_and(|r| r.recording_url.is_some())
                && record.as_ref().is_some_and(|r| {
                    r.status == Some(lumicast_common::types::StreamStatus::Ended)
                })
                && viewers == 0;
            if done {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for finalization side effects"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The stream id is reusable immediately.
        assert!(!server.state.registry.channel_exists(&"stream-1".into()).await);
    }

    #[tokio::test]
    async fn stream_ended_without_save_discards_recording() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;

        ws_send(
            &mut broadcaster,
            &ClientMessage::VideoChunk {
                stream_id: "stream-1".into(),
                chunk: "AQID".into(),
                chunk_index: 0,
            },
        )
        .await;
        ws_send(
            &mut broadcaster,
            &ClientMessage::StreamEnded {
                stream_id: "stream-1".into(),
                save_recording: Some(false),
            },
        )
        .await;

        assert!(matches!(
            recv_until(&mut watcher, |m| matches!(m, ServerMessage::StreamEnded { .. })).await,
            ServerMessage::StreamEnded { .. }
        ));

        // Status and metrics still land; the buffered segments are dropped.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let record = server
                .state
                .metadata
                .find_stream(&"stream-1".into())
                .await
                .expect("metadata lookup should succeed");
            let done = record.as_ref().is_some_and(|r| {
                r.status == Some(lumicast_common::types::StreamStatus::Ended)
                    && r.final_metrics.is_some_and(|m| m.peak_watchers == 1)
            });
            if done {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for finalization side effects"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(server.state.storage.stored_blob(&"stream-1".into()).await.is_none());
        let record = server
            .state
            .metadata
            .find_stream(&"stream-1".into())
            .await
            .expect("metadata lookup should succeed")
            .expect("stream record should exist");
        assert!(record.recording_url.is_none());
    }

    #[tokio::test]
    async fn broadcaster_disconnect_tears_down_the_channel() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        recv_until(&mut watcher, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;

        broadcaster.close(None).await.expect("broadcaster socket should close");

        match recv_until(&mut watcher, |m| matches!(m, ServerMessage::StreamEnded { .. })).await {
            ServerMessage::StreamEnded { stream_id } => {
                assert_eq!(stream_id.as_str(), "stream-1");
            }
            other => panic!("expected stream-ended frame, got {other:?}"),
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.state.registry.channel_exists(&"stream-1".into()).await {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for channel teardown"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A fresh broadcaster can claim the id right away.
        let mut successor = connect(server.addr).await;
        expect_connected(&mut successor).await;
        ws_send(&mut successor, &announce("stream-1", None)).await;
        assert_eq!(ws_recv(&mut successor).await, ServerMessage::Broadcaster);
    }

    #[tokio::test]
    async fn watcher_disconnect_sends_bye_and_updated_count() {
        let server = spawn_default_server().await;

        let mut broadcaster = connect(server.addr).await;
        let mut watcher = connect(server.addr).await;
        expect_connected(&mut broadcaster).await;
        let watcher_id = expect_connected(&mut watcher).await;

        ws_send(&mut broadcaster, &announce("stream-1", None)).await;
        ws_send(&mut watcher, &ClientMessage::Watcher { stream_id: "stream-1".into() }).await;
        recv_until(&mut broadcaster, |m| matches!(m, ServerMessage::ViewerCount { .. })).await;

        watcher.close(None).await.expect("watcher socket should close");

        match recv_until(&mut broadcaster, |m| matches!(m, ServerMessage::Bye { .. })).await {
            ServerMessage::Bye { watcher_handle } => assert_eq!(watcher_handle, watcher_id),
            other => panic!("expected bye frame, got {other:?}"),
        }
        assert_eq!(
            recv_until(&mut broadcaster, |m| matches!(m, ServerMessage::ViewerCount { .. }))
                .await,
            ServerMessage::ViewerCount { count: 0 }
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored_and_the_connection_survives() {
        let server = spawn_default_server().await;

        let mut client = connect(server.addr).await;
        expect_connected(&mut client).await;

        client
            .send(WsFrame::Text("{not json at all".into()))
            .await
            .expect("garbage frame should send");
        client
            .send(WsFrame::Text(r#"{"type": "no-such-type"}"#.into()))
            .await
            .expect("unknown-type frame should send");
        // Structurally valid but with an unusable stream id; also dropped.
        ws_send(&mut client, &announce("", None)).await;

        // The connection is still usable.
        ws_send(&mut client, &announce("stream-1", None)).await;
        assert_eq!(ws_recv(&mut client).await, ServerMessage::Broadcaster);
    }
}
