//! WebSocket handler for lifecycle notices.
//!
//! Clients connect to `/ws/events` and receive every [`SessionNotice`] as
//! JSON. Sending `{"subscribe":"shop1"}` narrows the stream to matching
//! session ids; `{"unsubscribe":"shop1"}` removes a filter again.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use pairhub_core::SessionNotice;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;

use super::SharedState;

#[derive(Deserialize)]
struct SubscriptionRequest {
    /// Session id pattern (`*` for all, `shop*` for a prefix).
    subscribe: String,
}

#[derive(Deserialize)]
struct UnsubscriptionRequest {
    unsubscribe: String,
}

type Subscriptions = Arc<Mutex<HashSet<String>>>;

/// Handler for GET /ws/events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>) {
    let (mut sender, mut receiver) = socket.split();
    let subscriptions: Subscriptions = Arc::new(Mutex::new(HashSet::new()));
    let mut notices = state.event_bus().subscribe();

    let subs_clone = Arc::clone(&subscriptions);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                apply_request(&subs_clone, text.as_str());
            }
        }
    });

    let send_task = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    if !wants(&subscriptions, &notice) {
                        continue;
                    }
                    match serde_json::to_string(&notice) {
                        Ok(json) => {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break; // Client disconnected
                            }
                        }
                        Err(e) => log::warn!("Failed to serialize notice: {}", e),
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    log::warn!("WebSocket client lagged by {} notices", count);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = recv_task => {},
        _ = send_task => {},
    }

    log::debug!("WebSocket connection closed");
}

fn apply_request(subscriptions: &Subscriptions, text: &str) {
    let mut subs = subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
    if let Ok(req) = serde_json::from_str::<SubscriptionRequest>(text) {
        log::debug!("WebSocket subscribed to {}", req.subscribe);
        subs.insert(req.subscribe);
    } else if let Ok(req) = serde_json::from_str::<UnsubscriptionRequest>(text) {
        log::debug!("WebSocket unsubscribed from {}", req.unsubscribe);
        subs.remove(&req.unsubscribe);
    }
}

/// No subscriptions means everything is forwarded.
fn wants(subscriptions: &Subscriptions, notice: &SessionNotice) -> bool {
    let subs = subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
    subs.is_empty()
        || subs
            .iter()
            .any(|pattern| matches_pattern(notice.session_id.as_str(), pattern))
}

/// `*` matches every id; a trailing `*` matches by prefix.
fn matches_pattern(session_id: &str, pattern: &str) -> bool {
    if session_id == pattern || pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => session_id.starts_with(prefix),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairhub_core::{NoticeKind, SessionId};

    fn notice(raw: &str) -> SessionNotice {
        SessionNotice::new(SessionId::parse(raw).unwrap(), NoticeKind::Ready)
    }

    mod patterns {
        use super::*;

        #[test]
        fn exact_match() {
            assert!(matches_pattern("shop1", "shop1"));
            assert!(!matches_pattern("shop1", "shop2"));
        }

        #[test]
        fn wildcard_matches_everything() {
            assert!(matches_pattern("shop1", "*"));
            assert!(matches_pattern("warehouse", "*"));
        }

        #[test]
        fn prefix_match() {
            assert!(matches_pattern("shop1", "shop*"));
            assert!(matches_pattern("shop", "shop*"));
            assert!(!matches_pattern("warehouse", "shop*"));
        }
    }

    mod filtering {
        use super::*;

        #[test]
        fn no_subscriptions_forwards_all() {
            let subs: Subscriptions = Arc::default();
            assert!(wants(&subs, &notice("shop1")));
        }

        #[test]
        fn subscribe_then_unsubscribe() {
            let subs: Subscriptions = Arc::default();

            apply_request(&subs, r#"{"subscribe":"shop1"}"#);
            assert!(wants(&subs, &notice("shop1")));
            assert!(!wants(&subs, &notice("shop2")));

            apply_request(&subs, r#"{"unsubscribe":"shop1"}"#);
            assert!(subs.lock().unwrap().is_empty());
            assert!(wants(&subs, &notice("shop2")));
        }

        #[test]
        fn garbage_is_ignored() {
            let subs: Subscriptions = Arc::default();
            apply_request(&subs, "hello");
            apply_request(&subs, r#"{"subscribe":42}"#);
            assert!(subs.lock().unwrap().is_empty());
        }
    }
}
