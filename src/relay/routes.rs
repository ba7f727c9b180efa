use std::sync::Arc;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::Filter;

use super::connection;
use super::RelayState;

#[derive(Debug, Deserialize)]
struct JoinQuery {
    participant: String,
}

/// All relay routes: the room socket, health and retained snapshots.
pub fn routes(state: Arc<RelayState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    room_snapshot(state.clone())
        .or(room_socket(state.clone()))
        .or(health_check(state))
}

fn room_socket(state: Arc<RelayState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("rooms" / String)
        .and(warp::query::<JoinQuery>())
        .and(warp::ws())
        .and(with_state(state))
        .map(|room: String, query: JoinQuery, ws: warp::ws::Ws, state: Arc<RelayState>| {
            let room_id = decode(&room);
            let participant_id = query.participant.trim().to_string();
            if room_id.is_empty() || participant_id.is_empty() {
                return Box::new(warp::reply::with_status(
                    "room and participant are required",
                    StatusCode::BAD_REQUEST,
                )) as Box<dyn warp::Reply>;
            }
            Box::new(ws.on_upgrade(move |websocket| {
                connection::handle_room_socket(websocket, state, room_id, participant_id)
            }))
        })
}

fn health_check(state: Arc<RelayState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(|state: Arc<RelayState>| async move {
            Ok::<_, warp::Rejection>(warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "classroom-relay",
                "version": env!("CARGO_PKG_VERSION"),
                "rooms": state.room_count().await,
                "connections": state.connection_count().await,
            })))
        })
}

fn room_snapshot(state: Arc<RelayState>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path!("rooms" / String / "snapshot")
        .and(warp::get())
        .and(with_state(state))
        .and_then(|room: String, state: Arc<RelayState>| async move {
            let snapshot = state.snapshot(&decode(&room)).await.unwrap_or_default();
            Ok::<_, warp::Rejection>(warp::reply::json(&snapshot))
        })
}

fn decode(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

fn with_state(
    state: Arc<RelayState>,
) -> impl Filter<Extract = (Arc<RelayState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}
