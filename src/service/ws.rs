use std::borrow::Cow;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::common::FaceIdError;
use crate::service::enrollment::{EnrollmentContext, EnrollmentSession};
use crate::service::protocol::{ClientMessage, ServerMessage};

/// Largest frame accepted on the enrollment socket.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Drives one enrollment session for the lifetime of `socket`.
///
/// Frames are handled strictly in arrival order, one reply per frame. The
/// socket is closed once the session reaches a terminal phase; however the
/// loop ends, the session's disconnect hook runs exactly once afterwards.
pub async fn run_enrollment_socket(socket: WebSocket, ctx: EnrollmentContext) {
    let (mut sender, mut receiver) = socket.split();
    let mut session = EnrollmentSession::new(ctx);
    info!(session_id = %session.session_id(), "enrollment connection opened");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %session.session_id(), error = %e, "read error");
                break;
            }
        };

        let reply = match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => session.handle(message).await,
                Err(e) => {
                    warn!(session_id = %session.session_id(), error = %e, "malformed frame");
                    let err = FaceIdError::Transport(format!("Malformed message: {}", e));
                    ServerMessage::error(err.to_string())
                }
            },
            Message::Binary(bytes) => match session.submit_sample(bytes).await {
                Ok(reply) => reply,
                Err(e) => session.reply_for(e),
            },
            Message::Close(_) => {
                debug!(session_id = %session.session_id(), "client closed the connection");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !send_reply(&mut sender, &reply).await {
            break;
        }

        if session.phase().is_terminal() {
            let reason = format!("registration {}", session.phase());
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::NORMAL,
                    reason: Cow::Owned(reason),
                })))
                .await;
            break;
        }
    }

    session.on_disconnect().await;
    info!(
        session_id = %session.session_id(),
        phase = %session.phase(),
        "enrollment connection closed"
    );
}

async fn send_reply(sender: &mut SplitSink<WebSocket, Message>, reply: &ServerMessage) -> bool {
    let text = match serde_json::to_string(reply) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode reply");
            return false;
        }
    };
    sender.send(Message::Text(text)).await.is_ok()
}
