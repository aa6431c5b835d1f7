use std::{
    borrow::Cow,
    fmt::Display,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    http::{header::ORIGIN, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{
    sink::{Sink, SinkExt},
    stream::{Stream, StreamExt},
};
use tokio::{sync::mpsc, task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{AppErr, DecodeErr},
    session::Session,
    state::{LiveSessions, Rooms},
};

pub fn router() -> Router {
    Router::new().route("/ws", get(ws_handler))
}

async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: HeaderMap,
    Extension(cfg): Extension<Arc<Config>>,
    Extension(rooms): Extension<Rooms>,
    Extension(live): Extension<LiveSessions>,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !cfg.origin_allowed(origin) {
        warn!(origin = ?origin, "WebSocket upgrade refused");
        return AppErr::Forbidden("origin not allowed".into()).into_response();
    }
    match ws {
        Ok(ws) => ws
            .on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {e}"))
            .on_upgrade(move |s| user_ws(s, cfg, rooms, live)),
        Err(rej) => {
            warn!("WebSocket upgrade failed: {rej}");
            rej.into_response()
        }
    }
}

/* ---------------- per connection ---------------- */
async fn user_ws(sock: WebSocket, cfg: Arc<Config>, rooms: Rooms, live: LiveSessions) {
    let (sink, stream) = sock.split();
    drive(sink, stream, cfg, rooms, live).await;
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    PeerClosed,
    ReadFailed,
    Malformed,
    /// The writer task stopped (write error or timeout); the socket is dead.
    WriterGone,
}

impl Ending {
    fn close_frame(self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            Ending::PeerClosed | Ending::ReadFailed => (close_code::NORMAL, "bye"),
            Ending::Malformed => (close_code::ERROR, "Internal Error"),
            Ending::WriterGone => return None,
        };
        Some(CloseFrame { code, reason: Cow::Borrowed(reason) })
    }
}

/// Run one connection: writer task, SOCKET_ID, receive loop, then leave the
/// room and close. Works on any message sink/stream pair.
async fn drive<Si, St, E>(sink: Si, mut stream: St, cfg: Arc<Config>, rooms: Rooms, live: LiveSessions) -> Ending
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (tx, rx) = mpsc::channel(cfg.outbound_queue);
    let mut writer = tokio::spawn(write_loop(sink, rx, cfg.send_timeout));
    let closer = tx.clone();

    let mut session = match Session::open(rooms, tx).await {
        Ok(s) => s,
        Err(e) => {
            warn!("session setup failed: {e}");
            writer.abort();
            return Ending::WriterGone;
        }
    };
    live.fetch_add(1, Ordering::Relaxed);

    let ending = read_loop(&mut session, &mut stream, &mut writer).await;

    session.close().await;
    live.fetch_sub(1, Ordering::Relaxed);

    match ending.close_frame() {
        Some(frame) => {
            // best effort; a full queue means the peer is not reading anyway
            let _ = closer.try_send(Message::Close(Some(frame)));
            drop(closer);
            if time::timeout(cfg.send_timeout, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        None => drop(closer),
    }
    ending
}

/// Feed inbound frames to the session until the peer goes away, a frame is
/// malformed, or the writer task ends.
async fn read_loop<St, E>(session: &mut Session, stream: &mut St, writer: &mut JoinHandle<()>) -> Ending
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut *writer => {
                info!(session = %session.id(), room = ?session.current_room(), "writer stopped, dropping connection");
                return Ending::WriterGone;
            }
        };
        let raw = match frame {
            None | Some(Ok(Message::Close(_))) => return Ending::PeerClosed,
            Some(Ok(Message::Text(t))) => t,
            Some(Ok(Message::Binary(b))) => match String::from_utf8(b) {
                Ok(t) => t,
                Err(e) => {
                    warn!(session = %session.id(), "{}", DecodeErr::from(e));
                    return Ending::Malformed;
                }
            },
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                info!(session = %session.id(), "read failed: {e}");
                return Ending::ReadFailed;
            }
        };
        if let Err(e) = session.handle_frame(&raw).await {
            warn!(session = %session.id(), room = ?session.current_room(), "{e}");
            return Ending::Malformed;
        }
    }
}

/// Single writer for the socket: drains the session's queue until every
/// sender is gone, a write fails or times out, or a close frame has gone out.
async fn write_loop<Si>(mut sink: Si, mut rx: mpsc::Receiver<Message>, limit: Duration)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        match time::timeout(limit, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("write failed: {e}");
                break;
            }
            Err(_) => {
                warn!("write timed out after {limit:?}");
                break;
            }
        }
        if closing {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::{Request, StatusCode}};
    use futures_util::{sink, stream};
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(origins: &str) -> Router {
        let cfg = Config::from_lookup(|k| (k == "ALLOWED_ORIGINS").then(|| origins.to_string())).unwrap();
        router()
            .layer(Extension(Arc::new(cfg)))
            .layer(Extension(Rooms::default()))
            .layer(Extension(LiveSessions::default()))
    }

    fn upgrade_req(origin: &str) -> Request<Body> {
        Request::builder()
            .uri("/ws")
            .header("origin", origin)
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    fn cfg(send_timeout_ms: &str) -> Arc<Config> {
        let ms = send_timeout_ms.to_string();
        Arc::new(Config::from_lookup(|k| (k == "SEND_TIMEOUT_MS").then(|| ms.clone())).unwrap())
    }

    /// Sink that hands every written frame to a channel.
    fn capture() -> (impl Sink<Message, Error = String> + Unpin + Send + 'static, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Box::pin(sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|e| e.to_string())?;
            Ok::<_, String>(tx)
        }));
        (sink, rx)
    }

    /// Sink that accepts `ok` writes and fails after that.
    fn failing_after(ok: usize) -> impl Sink<Message, Error = String> + Unpin + Send + 'static {
        Box::pin(sink::unfold(ok, |left, _msg: Message| async move {
            if left == 0 { Err("peer gone".to_string()) } else { Ok(left - 1) }
        }))
    }

    /// Sink whose writes never finish.
    fn stalled() -> impl Sink<Message, Error = String> + Unpin + Send + 'static {
        Box::pin(sink::unfold((), |(), _msg: Message| async move {
            std::future::pending::<Result<(), String>>().await
        }))
    }

    fn text(v: Value) -> Result<Message, String> { Ok(Message::Text(v.to_string())) }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn close_code_of(m: &Message) -> Option<u16> {
        match m {
            Message::Close(Some(f)) => Some(f.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn foreign_origin_is_refused() {
        let resp = app("https://rooms.example")
            .oneshot(upgrade_req("https://evil.example"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn plain_get_is_not_an_upgrade() {
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = app("*").oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn peer_close_leaves_room_and_sends_normal_close() {
        let rooms = Rooms::default();
        let live = LiveSessions::default();
        let r = rooms.create("r".into(), String::new()).await.id;
        let (sink, mut out) = capture();
        let inbound = stream::iter(vec![
            text(serde_json::json!({"type": "CHANGE_ROOM", "payload": r})),
            Ok(Message::Close(None)),
        ]);

        let ending = drive(sink, inbound, cfg("500"), rooms.clone(), live.clone()).await;

        assert_eq!(ending, Ending::PeerClosed);
        assert_eq!(rooms.member_count(&r).await, Ok(0));
        assert_eq!(live.load(Ordering::Relaxed), 0);
        let frames = drain(&mut out);
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], Message::Text(t) if t.contains("SOCKET_ID")));
        assert!(matches!(&frames[1], Message::Text(t) if t.contains("CHAT")));
        assert_eq!(close_code_of(&frames[2]), Some(close_code::NORMAL));
    }

    #[tokio::test]
    async fn malformed_frame_closes_with_error_code() {
        let rooms = Rooms::default();
        let live = LiveSessions::default();
        let r = rooms.create("r".into(), String::new()).await.id;
        let (sink, mut out) = capture();
        let inbound = stream::iter(vec![
            text(serde_json::json!({"type": "CHANGE_ROOM", "payload": r})),
            text(serde_json::json!({"type": "SEEK", "payload": "later"})),
            text(serde_json::json!({"type": "SEEK", "payload": 10})),
        ]);

        let ending = drive(sink, inbound, cfg("500"), rooms.clone(), live.clone()).await;

        assert_eq!(ending, Ending::Malformed);
        assert_eq!(rooms.member_count(&r).await, Ok(0));
        assert_eq!(live.load(Ordering::Relaxed), 0);
        let frames = drain(&mut out);
        // the frame after the bad one is never relayed
        assert!(!frames.iter().any(|m| matches!(m, Message::Text(t) if t.contains("SEEK"))));
        assert_eq!(frames.last().and_then(close_code_of), Some(close_code::ERROR));
    }

    #[tokio::test]
    async fn read_error_ends_session() {
        let rooms = Rooms::default();
        let live = LiveSessions::default();
        let (sink, _out) = capture();
        let inbound = stream::iter(vec![Err::<Message, _>("connection reset".to_string())]);

        let ending = drive(sink, inbound, cfg("500"), rooms, live.clone()).await;
        assert_eq!(ending, Ending::ReadFailed);
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn dead_writer_ends_session_and_leaves_room() {
        let rooms = Rooms::default();
        let live = LiveSessions::default();
        let r = rooms.create("r".into(), String::new()).await.id;
        // SOCKET_ID and the replay go through, the next write fails
        let sink = failing_after(2);
        let inbound = stream::iter(vec![text(serde_json::json!({"type": "CHANGE_ROOM", "payload": r}))])
            .chain(stream::pending());

        let conn = tokio::spawn(drive(sink, inbound, cfg("500"), rooms.clone(), live.clone()));
        while rooms.member_count(&r).await != Ok(1) {
            time::sleep(Duration::from_millis(5)).await;
        }
        rooms.broadcast(&r, &crate::protocol::Outbound::Seek(1)).await.unwrap();

        let ending = time::timeout(Duration::from_secs(2), conn).await.unwrap().unwrap();
        assert_eq!(ending, Ending::WriterGone);
        assert_eq!(rooms.member_count(&r).await, Ok(0));
        assert_eq!(live.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn write_timeout_stops_writer() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::Text("x".into())).await.unwrap();
        let done = time::timeout(Duration::from_secs(2), write_loop(stalled(), rx, Duration::from_millis(20))).await;
        assert!(done.is_ok());
        // the receiver went with the writer
        assert!(tx.send(Message::Text("y".into())).await.is_err());
    }

    #[tokio::test]
    async fn writer_stops_after_close_frame() {
        let (sink, mut out) = capture();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::Text("a".into())).await.unwrap();
        tx.send(Message::Close(None)).await.unwrap();
        tx.send(Message::Text("b".into())).await.unwrap();

        write_loop(sink, rx, Duration::from_millis(500)).await;

        let frames = drain(&mut out);
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], Message::Text(t) if t == "a"));
        assert!(matches!(frames[1], Message::Close(None)));
    }
}
