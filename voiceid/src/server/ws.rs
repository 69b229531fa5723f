//! WebSocket streaming identification.
//!
//! Binary frames carry little-endian f32 samples; text frames carry JSON
//! control messages (`finish`, `cancel`, `close`). One connection serves
//! many identification rounds: after each round the finished session is
//! discarded and a fresh one opens with the same parameters, announced by
//! a `ready` message carrying the next round number. Failed rounds reset
//! the same way, so the connection survives partial failures.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Extension;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::decode_f32_frames;
use crate::manager::IdentifyResult;
use crate::streaming::StreamParams;

use super::{tenant_id, AppState, AuthContext};

const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Messages sent to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Connection {
        message: &'static str,
        sample_rate: u32,
    },
    AudioReceived {
        samples: usize,
        duration_ms: f64,
    },
    Result {
        round: u32,
        result: IdentifyResult,
    },
    Ready {
        round: u32,
        message: &'static str,
    },
    Cancelled,
    Closing,
    Error {
        message: String,
    },
}

/// Client control message. Any other shape is logged and ignored.
#[derive(Debug, Deserialize)]
struct ControlMessage {
    action: String,
}

/// GET /api/v1/speaker/identify_ws
pub(crate) async fn identify_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    auth: Option<Extension<AuthContext>>,
) -> Response {
    let sample_rate = query
        .get("sample_rate")
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|&sr| sr > 0)
        .unwrap_or(DEFAULT_SAMPLE_RATE);
    let threshold = query
        .get("threshold")
        .and_then(|s| s.parse::<f32>().ok())
        .filter(|&t| t > 0.0);

    let empty_form = HashMap::new();
    let auth = auth.as_deref();
    let params = StreamParams {
        uid: tenant_id(
            &headers,
            "x-user-id",
            &query,
            "uid",
            &empty_form,
            auth.map(|a| a.user_id.as_str()),
        ),
        agent_id: tenant_id(
            &headers,
            "x-agent-id",
            &query,
            "agent_id",
            &empty_form,
            auth.map(|a| a.agent_id.as_str()),
        ),
        speaker_id: query.get("speaker_id").cloned().unwrap_or_default(),
        speaker_name: query.get("speaker_name").cloned().unwrap_or_default(),
        sample_rate,
        threshold,
    };

    if params.uid.is_empty() {
        warn!("websocket identify without uid, queries run unfiltered");
    }

    ws.on_upgrade(move |socket| session_loop(socket, state, params))
}

/// Sends one typed message. Returns false when the socket is gone.
async fn send(socket: &mut WebSocket, msg: ServerMessage) -> bool {
    match serde_json::to_string(&msg) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode websocket message");
            false
        }
    }
}

async fn session_loop(mut socket: WebSocket, state: AppState, params: StreamParams) {
    let ws_config = state.config.server.websocket.clone();
    let read_timeout = Duration::from_secs(ws_config.read_timeout_secs);
    let sample_rate = params.sample_rate;

    let mut round: u32 = 1;
    let mut session = state.manager.streaming(params.clone());
    let mut total_samples: usize = 0;
    let mut chunk_count: usize = 0;

    info!(
        uid = %params.uid,
        sample_rate,
        threshold = session.threshold(),
        "websocket identification session opened"
    );

    if !send(
        &mut socket,
        ServerMessage::Connection {
            message: "WebSocket connected, ready for audio",
            sample_rate,
        },
    )
    .await
    {
        session.close().await;
        return;
    }

    loop {
        // The read deadline is refreshed by every inbound message,
        // protocol pings included.
        let received = if ws_config.read_timeout_secs > 0 {
            match tokio::time::timeout(read_timeout, socket.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    debug!("websocket read deadline expired");
                    break;
                }
            }
        } else {
            socket.recv().await
        };

        let msg = match received {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(error = %e, "websocket read error");
                break;
            }
            None => break,
        };

        match msg {
            Message::Binary(data) => {
                if ws_config.max_message_size > 0 && data.len() > ws_config.max_message_size {
                    warn!(
                        size = data.len(),
                        max = ws_config.max_message_size,
                        "dropping oversize websocket frame"
                    );
                    if !send(
                        &mut socket,
                        ServerMessage::Error {
                            message: "message too large".into(),
                        },
                    )
                    .await
                    {
                        break;
                    }
                    continue;
                }

                let samples = match decode_f32_frames(&data) {
                    Ok(samples) => samples,
                    Err(e) => {
                        if !send(
                            &mut socket,
                            ServerMessage::Error {
                                message: e.to_string(),
                            },
                        )
                        .await
                        {
                            break;
                        }
                        continue;
                    }
                };

                match session.accept(&samples).await {
                    Ok(()) => {
                        total_samples += samples.len();
                        chunk_count += 1;
                        let ack = ServerMessage::AudioReceived {
                            samples: samples.len(),
                            duration_ms: samples.len() as f64 / sample_rate as f64 * 1000.0,
                        };
                        if !send(&mut socket, ack).await {
                            break;
                        }
                    }
                    Err(e) => {
                        // Keep the connection usable: report, then reset to
                        // a fresh round.
                        if !send(
                            &mut socket,
                            ServerMessage::Error {
                                message: e.to_string(),
                            },
                        )
                        .await
                        {
                            break;
                        }
                        session.close().await;
                        round += 1;
                        session = state.manager.streaming(params.clone());
                        if !send(&mut socket, ready(round)).await {
                            break;
                        }
                    }
                }
            }

            Message::Text(text) => {
                let control: ControlMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(_) => {
                        debug!(text = %text, "ignoring malformed control message");
                        continue;
                    }
                };

                match control.action.as_str() {
                    "finish" => {
                        debug!(round, total_samples, chunk_count, "finishing round");
                        let reply = match session.finish().await {
                            Ok(result) => {
                                info!(
                                    round,
                                    identified = result.identified,
                                    speaker_id = %result.speaker_id,
                                    confidence = result.confidence,
                                    "identification round complete"
                                );
                                ServerMessage::Result { round, result }
                            }
                            Err(e) => ServerMessage::Error {
                                message: e.to_string(),
                            },
                        };
                        if !send(&mut socket, reply).await {
                            break;
                        }
                        round += 1;
                        session = state.manager.streaming(params.clone());
                        if !send(&mut socket, ready(round)).await {
                            break;
                        }
                    }
                    "cancel" => {
                        info!(round, "round cancelled by client");
                        session.close().await;
                        if !send(&mut socket, ServerMessage::Cancelled).await {
                            break;
                        }
                        round += 1;
                        session = state.manager.streaming(params.clone());
                        if !send(&mut socket, ready(round)).await {
                            break;
                        }
                    }
                    "close" => {
                        let _ = send(&mut socket, ServerMessage::Closing).await;
                        break;
                    }
                    other => {
                        warn!(action = %other, "unknown control action");
                    }
                }
            }

            Message::Ping(payload) => {
                // Reply with a matching pong; the deadline refresh already
                // happened by receiving the frame.
                if socket.send(Message::Pong(payload)).await.is_err() {
                    break;
                }
            }
            Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }

    session.close().await;
    info!(
        rounds = round,
        total_samples, chunk_count, "websocket identification session closed"
    );
}

fn ready(round: u32) -> ServerMessage {
    ServerMessage::Ready {
        round,
        message: "ready for next round",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_messages_serialize_with_type_tags() {
        let msg = serde_json::to_value(ServerMessage::Connection {
            message: "WebSocket connected, ready for audio",
            sample_rate: 16000,
        })
        .unwrap();
        assert_eq!(msg["type"], "connection");
        assert_eq!(msg["sample_rate"], 16000);

        let msg = serde_json::to_value(ServerMessage::AudioReceived {
            samples: 320,
            duration_ms: 20.0,
        })
        .unwrap();
        assert_eq!(msg["type"], "audio_received");
        assert_eq!(msg["samples"], 320);

        let msg = serde_json::to_value(ServerMessage::Result {
            round: 2,
            result: IdentifyResult {
                identified: true,
                speaker_id: "s1".into(),
                speaker_name: "Alice".into(),
                confidence: 0.82,
                threshold: 0.5,
            },
        })
        .unwrap();
        assert_eq!(msg["type"], "result");
        assert_eq!(msg["round"], 2);
        assert_eq!(msg["result"]["speaker_id"], "s1");

        assert_eq!(
            serde_json::to_value(ServerMessage::Cancelled).unwrap()["type"],
            "cancelled"
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::Closing).unwrap()["type"],
            "closing"
        );
        assert_eq!(serde_json::to_value(ready(3)).unwrap()["round"], 3);
    }

    #[test]
    fn control_message_parsing() {
        let msg: ControlMessage = serde_json::from_str(r#"{"action":"finish"}"#).unwrap();
        assert_eq!(msg.action, "finish");

        // Extra fields are tolerated, wrong shapes are not.
        assert!(serde_json::from_str::<ControlMessage>(r#"{"action":"cancel","x":1}"#).is_ok());
        assert!(serde_json::from_str::<ControlMessage>(r#"{"foo":"bar"}"#).is_err());
        assert!(serde_json::from_str::<ControlMessage>("not json").is_err());
    }
}
