//! Pub/sub forwarder: bridges `CoordinationStore` redis topics to WebSocket
//! clients (spec.md §4.9). Grounded on
//! `examples/original_source/src/server/routers/forwarder.py`'s
//! `clients_by_topic`/`topics_by_client` subscribe/unsubscribe protocol.

use std::collections::HashSet;

use log::{error, info, warn};
use rocket::{get, State};
use serde::Deserialize;

use crate::state::AppState;

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum WsAction {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Keepalive,
}

#[get("/ws")]
pub fn ws(ws: rocket_ws::WebSocket, state: &State<AppState>) -> rocket_ws::Channel<'_> {
    let coordination = state.coordination.clone();
    let redis_url = state.redis_url.clone();

    ws.channel(move |mut stream| {
        Box::pin(async move {
            use futures::{SinkExt, StreamExt};

            let mut subscribed: HashSet<String> = HashSet::new();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, Vec<u8>)>();

            loop {
                tokio::select! {
                    incoming = stream.next() => {
                        let Some(msg) = incoming else { break };
                        let Ok(msg) = msg else { break };
                        let rocket_ws::Message::Text(text) = msg else { continue };
                        match serde_json::from_str::<WsAction>(&text) {
                            Ok(WsAction::Subscribe { topics }) => {
                                for topic in topics {
                                    if subscribed.insert(topic.clone()) {
                                        spawn_topic_listener(coordination.clone(), redis_url.clone(), topic, tx.clone());
                                    }
                                }
                            }
                            Ok(WsAction::Unsubscribe { topics }) => {
                                for topic in &topics {
                                    subscribed.remove(topic);
                                }
                            }
                            Ok(WsAction::Keepalive) => {}
                            Err(e) => warn!("invalid ws action: {e}"),
                        }
                    }
                    Some((topic, payload)) = rx.recv() => {
                        if !subscribed.contains(&topic) {
                            continue;
                        }
                        let text = String::from_utf8_lossy(&payload).to_string();
                        if stream.send(rocket_ws::Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("websocket client disconnected");
            Ok(())
        })
    })
}

/// One long-lived subscription task per distinct topic a client asks for,
/// forwarding every published message back through `tx` until the client
/// unsubscribes or disconnects (the channel simply stops draining).
fn spawn_topic_listener(
    coordination: std::sync::Arc<chomp_core::CoordinationStore>,
    redis_url: String,
    topic: String,
    tx: tokio::sync::mpsc::UnboundedSender<(String, Vec<u8>)>,
) {
    tokio::spawn(async move {
        let result = coordination
            .subscribe(&redis_url, &[topic.clone()], |_channel, payload| {
                let tx = tx.clone();
                let topic = topic.clone();
                async move {
                    let _ = tx.send((topic, payload));
                }
            })
            .await;
        if let Err(e) = result {
            error!("pub/sub listener for topic {topic} failed: {e}");
        }
    });
}

pub fn routes() -> Vec<rocket::Route> {
    rocket::routes![ws]
}
