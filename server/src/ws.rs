//! Topic-based publish/subscribe hub behind the `/api/ws` conduit.
//!
//! A single dispatcher task owns every piece of subscriber state; the rest of
//! the process only talks to it through two channels. Publishing is always
//! non-blocking: a full publish channel drops the message, and a subscriber
//! that cannot drain its bounded outbound queue is disconnected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use common::models::{Event, PublishFn};
use common::new_id;

/// Time allowed to write one message to a peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Depth of the central publish channel and of each subscriber queue.
const CHANNEL_CAPACITY: usize = 256;

/// Frame fanned out to subscribers.
#[derive(serde::Serialize)]
struct Frame<'a> {
    topic: &'a str,
    payload: &'a Value,
}

enum Command {
    Register {
        id: String,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        id: String,
    },
    Subscribe {
        id: String,
        topic: String,
    },
    Unsubscribe {
        id: String,
        topic: String,
    },
}

struct Published {
    topic: String,
    payload: Value,
}

/// Cheap cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct Hub {
    control: mpsc::UnboundedSender<Command>,
    publish: mpsc::Sender<Published>,
}

impl Hub {
    /// Spawn the dispatcher and return its handle.
    pub fn start() -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::channel(CHANNEL_CAPACITY);
        actix_web::rt::spawn(dispatch(control_rx, publish_rx));
        Self {
            control: control_tx,
            publish: publish_tx,
        }
    }

    /// Non-blocking publish: when the channel is full the message is dropped
    /// and logged rather than stalling the producer.
    pub fn publish_json(&self, topic: &str, payload: Value) {
        let msg = Published {
            topic: topic.to_string(),
            payload,
        };
        if self.publish.try_send(msg).is_err() {
            log::warn!("publish channel full, dropping message for topic {}", topic);
        }
    }

    pub fn publish_event(&self, topic: &str, event: &Event) {
        match serde_json::to_value(event) {
            Ok(payload) => self.publish_json(topic, payload),
            Err(e) => log::warn!("failed to serialize event for topic {}: {}", topic, e),
        }
    }

    fn register(&self, id: &str, sender: mpsc::Sender<String>) {
        let _ = self.control.send(Command::Register {
            id: id.to_string(),
            sender,
        });
    }

    fn unregister(&self, id: &str) {
        let _ = self.control.send(Command::Unregister { id: id.to_string() });
    }

    fn subscribe(&self, id: &str, topic: &str) {
        let _ = self.control.send(Command::Subscribe {
            id: id.to_string(),
            topic: topic.to_string(),
        });
    }

    fn unsubscribe(&self, id: &str, topic: &str) {
        let _ = self.control.send(Command::Unsubscribe {
            id: id.to_string(),
            topic: topic.to_string(),
        });
    }
}

/// Adapt the hub into the callback shape the proxy pipeline and the reaper
/// expect.
pub fn publish_fn(hub: &Hub) -> PublishFn {
    let hub = hub.clone();
    Arc::new(move |topic, event| hub.publish_event(topic, &event))
}

async fn dispatch(
    mut control: mpsc::UnboundedReceiver<Command>,
    mut publish: mpsc::Receiver<Published>,
) {
    let mut clients: HashMap<String, mpsc::Sender<String>> = HashMap::new();
    let mut topics: HashMap<String, HashSet<String>> = HashMap::new();
    let mut client_topics: HashMap<String, HashSet<String>> = HashMap::new();

    loop {
        tokio::select! {
            // Control traffic first: a publish must see every subscribe that
            // was issued before it.
            biased;

            cmd = control.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Register { id, sender } => {
                        log::debug!("hub client {} registered", id);
                        clients.insert(id, sender);
                    }
                    Command::Unregister { id } => {
                        log::debug!("hub client {} unregistered", id);
                        remove_client(&id, &mut clients, &mut topics, &mut client_topics);
                    }
                    Command::Subscribe { id, topic } => {
                        if clients.contains_key(&id) {
                            log::debug!("hub client {} subscribed to {}", id, topic);
                            topics.entry(topic.clone()).or_default().insert(id.clone());
                            client_topics.entry(id).or_default().insert(topic);
                        }
                    }
                    Command::Unsubscribe { id, topic } => {
                        log::debug!("hub client {} unsubscribed from {}", id, topic);
                        if let Some(subscribers) = topics.get_mut(&topic) {
                            subscribers.remove(&id);
                        }
                        if let Some(subscribed) = client_topics.get_mut(&id) {
                            subscribed.remove(&topic);
                        }
                    }
                }
            }

            msg = publish.recv() => {
                let Some(msg) = msg else { break };
                let Some(subscribers) = topics.get(&msg.topic) else { continue };
                let frame = match serde_json::to_string(&Frame {
                    topic: &msg.topic,
                    payload: &msg.payload,
                }) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("failed to serialize frame for {}: {}", msg.topic, e);
                        continue;
                    }
                };

                let mut slow: Vec<String> = Vec::new();
                for id in subscribers {
                    if let Some(sender) = clients.get(id) {
                        if sender.try_send(frame.clone()).is_err() {
                            slow.push(id.clone());
                        }
                    }
                }
                for id in slow {
                    log::warn!("hub client {} cannot keep up, dropping", id);
                    remove_client(&id, &mut clients, &mut topics, &mut client_topics);
                }
            }
        }
    }
}

fn remove_client(
    id: &str,
    clients: &mut HashMap<String, mpsc::Sender<String>>,
    topics: &mut HashMap<String, HashSet<String>>,
    client_topics: &mut HashMap<String, HashSet<String>>,
) {
    // Dropping the sender closes the client's write pump.
    clients.remove(id);
    if let Some(subscribed) = client_topics.remove(id) {
        for topic in subscribed {
            if let Some(subscribers) = topics.get_mut(&topic) {
                subscribers.remove(id);
            }
        }
    }
}

/// GET /api/ws: upgrade and hand the connection to the hub.
pub async fn ws_entry(
    req: HttpRequest,
    stream: web::Payload,
    hub: web::Data<Hub>,
) -> actix_web::Result<HttpResponse> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let id = new_id();
    log::info!("websocket client {} connected", id);

    let (sender, receiver) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    hub.register(&id, sender);

    actix_web::rt::spawn(write_pump(session.clone(), receiver));
    actix_web::rt::spawn(read_pump(hub.get_ref().clone(), id, session, msg_stream));

    Ok(response)
}

async fn write_pump(mut session: actix_ws::Session, mut receiver: mpsc::Receiver<String>) {
    while let Some(frame) = receiver.recv().await {
        match tokio::time::timeout(WRITE_WAIT, session.text(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return,
            Err(_) => {
                log::warn!("websocket write deadline exceeded, closing");
                break;
            }
        }
    }
    let _ = session.close(None).await;
}

async fn read_pump(
    hub: Hub,
    id: String,
    mut session: actix_ws::Session,
    mut stream: actix_ws::MessageStream,
) {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_text(&hub, &id, &mut session, &text).await,
            Message::Ping(bytes) => {
                let _ = session.pong(&bytes).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    hub.unregister(&id);
    log::debug!("websocket client {} disconnected", id);
}

async fn handle_text(hub: &Hub, id: &str, session: &mut actix_ws::Session, text: &str) {
    let Ok(msg) = serde_json::from_str::<Value>(text) else {
        log::warn!("non-JSON websocket message: {}", text);
        return;
    };
    let Some(msg_type) = msg.get("type").and_then(|t| t.as_str()) else {
        log::warn!("websocket message without type field");
        return;
    };

    match msg_type {
        "ping" => {
            let _ = tokio::time::timeout(WRITE_WAIT, session.text(r#"{"type":"pong"}"#)).await;
        }
        "subscribe" => match msg.get("topic").and_then(|t| t.as_str()) {
            Some(topic) => hub.subscribe(id, topic),
            None => log::warn!("subscribe message without topic"),
        },
        "unsubscribe" => match msg.get("topic").and_then(|t| t.as_str()) {
            Some(topic) => hub.unsubscribe(id, topic),
            None => log::warn!("unsubscribe message without topic"),
        },
        other => log::warn!("unknown websocket message type: {}", other),
    }
}
