use crate::networking::chat::Chat;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info_span, Instrument};
use uuid::Uuid;
use warp::{Filter, Reply};

/// The single route of a CAP: `GET /connect` upgrades to a WebSocket and
/// hands the frame stream to the router. Every connection runs inside a span
/// carrying a fresh trace id.
pub fn connect_route(
    chat: Arc<Chat>,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::path("connect")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_chat(chat))
        .map(|ws: warp::ws::Ws, chat: Arc<Chat>| {
            ws.on_upgrade(move |socket| {
                chat.connect(socket)
                    .instrument(info_span!("connection", trace_id = %Uuid::new_v4()))
            })
        })
}

fn with_chat(chat: Arc<Chat>) -> impl Filter<Extract = (Arc<Chat>,), Error = Infallible> + Clone {
    warp::any().map(move || chat.clone())
}
