//! Websocket bridge between an axum socket and a [`Session`].
//!
//! The socket is split in two. This task reads frames and hands text to the
//! session; a writer task owns the sink and drains the session's outbound
//! queue, so frames from concurrent command tasks are never interleaved.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use quanttp_core::{Limits, SourceRegistry};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::{OUTBOUND_QUEUE, Outbound, Session};

pub(crate) async fn serve_socket(
    socket: WebSocket,
    registry: Arc<SourceRegistry>,
    limits: Limits,
    default_device: Option<String>,
) {
    let conn = Uuid::new_v4().to_string();
    log::debug!("[{conn}] connected");

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let mut writer = tokio::spawn(write_loop(sink, rx));
    let mut session = Session::new(conn.clone(), registry, limits, default_device, tx);

    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => session.handle(text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("[{conn}] read failed: {e}");
                    break;
                }
            },
            _ = &mut writer, if !writer_done => {
                // The writer sent a close frame or lost the socket.
                writer_done = true;
                break;
            }
        }
    }

    // Dropping the session's last sender lets the writer flush and exit.
    session.shutdown().await;
    if !writer_done {
        let _ = writer.await;
    }
    log::debug!("[{conn}] disconnected");
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(msg) = rx.recv().await {
        let frame = match msg {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Binary(bytes) => Message::Binary(bytes.into()),
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };
        if sink.send(frame).await.is_err() {
            break;
        }
    }
}
