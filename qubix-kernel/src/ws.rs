/**
 * TRANSPORT WEBSOCKET - Pont entre une socket axum et l'EventHub
 *
 * Une connexion = deux moitiés :
 * - tâche d'écriture : vide le canal Outbound de la connexion vers la socket,
 *   envoie un Close quand le hub ferme (éviction, shutdown) ; chaque envoi
 *   est borné par `send_timeout`, un pair qui ne lit plus est abandonné
 * - boucle de lecture : trames texte → hub.handle_message, ping → activité,
 *   close/erreur → fin
 * Dans tous les cas la connexion est retirée du registre à la sortie.
 */

use crate::http::AppState;
use crate::hub::EventHub;
use crate::registry::Outbound;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: EventHub) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (conn_id, outbound) = hub.open_connection();

    let send_timeout = hub.config().send_timeout;
    let mut writer = tokio::spawn(forward_outbound(ws_sender, outbound, send_timeout));

    loop {
        tokio::select! {
            // fermé côté serveur
            _ = &mut writer => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => hub.handle_message(&conn_id, text.as_str()).await,
                Some(Ok(Message::Binary(bin))) => {
                    let text = String::from_utf8_lossy(bin.as_ref());
                    hub.handle_message(&conn_id, &text).await;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => hub.touch(&conn_id),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("[ws] {} transport error: {}", conn_id, e);
                    break;
                }
            }
        }
    }

    hub.close_connection(&conn_id);
    writer.abort();
}

/// Vide le canal sortant vers la socket ; retourne au premier envoi
/// en erreur ou qui dépasse `send_timeout`
async fn forward_outbound<S>(mut sink: S, mut outbound: mpsc::Receiver<Outbound>, send_timeout: Duration)
where
    S: Sink<Message> + Unpin,
{
    while let Some(out) = outbound.recv().await {
        match out {
            Outbound::Frame(text) => match tokio::time::timeout(send_timeout, sink.send(Message::Text(text.into()))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return,
                Err(_) => {
                    warn!("[ws] socket write timed out after {:?}, dropping peer", send_timeout);
                    return;
                }
            },
            Outbound::Close => break,
        }
    }
    let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(None))).await;
}
