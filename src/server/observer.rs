//! Websocket endpoints for live observers
//!
//! - `/ws` streams every broadcast
//! - `/ws/vehicle/{id}` streams broadcasts for one vehicle
//! - `/ws/stats` returns the registry snapshot as JSON

use super::{with_state, AppState};
use crate::broadcast::ObserverConnection;
use crate::protocol::{interpret_control, ControlRequest, ObserverFilter, ObserverMessage, VehicleId};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, info_span, Instrument};
use warp::ws::{Message, WebSocket, Ws};
use warp::Filter;

pub const INVALID_JSON_MESSAGE: &str = "Invalid JSON format";

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let all = warp::path!("ws")
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|ws: Ws, state: AppState| {
            ws.on_upgrade(move |socket| observer_session(socket, state, None))
        });

    let vehicle = warp::path!("ws" / "vehicle" / VehicleId)
        .and(warp::ws())
        .and(with_state(state.clone()))
        .map(|vehicle_id: VehicleId, ws: Ws, state: AppState| {
            ws.on_upgrade(move |socket| observer_session(socket, state, Some(vehicle_id)))
        });

    let stats = warp::path!("ws" / "stats")
        .and(warp::get())
        .and(with_state(state))
        .map(|state: AppState| warp::reply::json(&state.registry.stats()));

    stats.or(vehicle).or(all)
}

async fn observer_session(socket: WebSocket, state: AppState, scoped_vehicle: Option<VehicleId>) {
    let filter = scoped_vehicle
        .map(ObserverFilter::for_vehicle)
        .unwrap_or_default();
    let ObserverConnection { id, mut receiver } = state.registry.connect_with_welcome(filter);
    let span = info_span!("observer", connection_id = %id, vehicle_id = ?scoped_vehicle);

    async move {
        let registry = state.registry;
        let (mut sink, mut stream) = socket.split();

        // The registry owns the sending half; dropping it on disconnect ends this task
        let writer = tokio::spawn(
            async move {
                while let Some(text) = receiver.recv().await {
                    if sink.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .in_current_span(),
        );

        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "Observer socket error");
                    break;
                }
            };
            if frame.is_close() {
                break;
            }
            let Ok(text) = frame.to_str() else {
                continue;
            };

            match interpret_control(text) {
                ControlRequest::Ping { timestamp } => {
                    registry.send_to(
                        id,
                        &ObserverMessage::Pong {
                            vehicle_id: scoped_vehicle,
                            timestamp,
                        },
                    );
                }
                ControlRequest::Subscribe(update) => {
                    let mut filter = registry.filter_of(id).unwrap_or_default();
                    filter.merge(update, scoped_vehicle);
                    info!(filter = ?filter, "Observer subscription updated");
                    registry.update_filter(id, filter);
                    registry.send_to(
                        id,
                        &ObserverMessage::SubscriptionAck {
                            message: "Subscription updated".to_string(),
                            timestamp: Utc::now(),
                        },
                    );
                }
                ControlRequest::InvalidJson => {
                    registry.send_to(id, &ObserverMessage::error(INVALID_JSON_MESSAGE));
                }
                ControlRequest::Ignored => {}
            }
        }

        registry.disconnect(id);
        let _ = writer.await;
    }
    .instrument(span)
    .await
}
