//! The single task that owns the broker state.
//!
//! Every inbound frame and every housekeeping tick reaches the tables through
//! this loop, one command at a time, so compound transitions (busy-check then
//! create, remove then pair) are never observable half-done. Outbound frames
//! are delivered best-effort: a writer channel that is full or gone loses the
//! frame, never the state transition.

use axum::extract::ws::Message;
use chrono::Utc;
use duet_core::{Broker, ClientMsg, ConnId, Outbound, ServerMsg};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Write half of one connection, as registered with the broker.
#[derive(Clone)]
pub struct ConnHandle {
    tx: mpsc::Sender<Message>,
}

impl ConnHandle {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }

    fn try_deliver(&self, msg: &ServerMsg) -> bool {
        match serde_json::to_string(msg) {
            Ok(raw) => self.tx.try_send(Message::Text(raw)).is_ok(),
            Err(_) => false,
        }
    }
}

pub enum Command {
    Frame {
        conn: ConnId,
        handle: ConnHandle,
        msg: ClientMsg,
    },
    Disconnect {
        conn: ConnId,
    },
}

pub async fn run(
    mut broker: Broker<ConnHandle>,
    mut commands: mpsc::Receiver<Command>,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let sweep_interval = std::cmp::max(Duration::from_millis(100), sweep_interval);
    let mut ticker = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Frame { conn, handle, msg }) => {
                        deliver(broker.dispatch(conn, &handle, msg, Utc::now()));
                    }
                    Some(Command::Disconnect { conn }) => {
                        let mut out = Vec::new();
                        broker.disconnect(conn, &mut out);
                        deliver(out);
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let out = broker.sweep(Utc::now());
                if !out.is_empty() {
                    debug!(event = "sweep_notices", count = out.len());
                }
                deliver(out);
            }
        }
    }
    info!(event = "broker_stop", users = broker.user_count());
}

fn deliver(out: Vec<Outbound<ConnHandle>>) {
    for Outbound { to, msg } in out {
        if !to.try_deliver(&msg) {
            warn!(event = "send_drop");
        }
    }
}
