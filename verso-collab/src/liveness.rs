//! Heartbeat supervision for one connection.
//!
//! Each tick either sends a ping or, if the previous ping was never
//! answered, declares the connection dead. A connection that stops
//! answering is therefore removed within two intervals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use verso_core::Replica;

use crate::connection::ConnectionHandle;
use crate::hub::SyncHub;

/// What the monitor should do on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Ping,
    Dead,
}

/// Pong bookkeeping shared between the reader and the monitor.
#[derive(Debug, Default)]
pub struct Liveness {
    awaiting_pong: AtomicBool,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> Probe {
        if self.awaiting_pong.swap(true, Ordering::AcqRel) {
            Probe::Dead
        } else {
            Probe::Ping
        }
    }

    pub fn pong_received(&self) {
        self.awaiting_pong.store(false, Ordering::Release);
    }

    pub fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong.load(Ordering::Acquire)
    }
}

/// Ping `conn` every `period` and evict it from `room` once a ping goes
/// unanswered. Ends on its own when the connection leaves the room.
pub fn spawn_monitor<D: Replica>(
    hub: Arc<SyncHub<D>>,
    room: String,
    conn: ConnectionHandle,
    liveness: Arc<Liveness>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let id = conn.id();

        loop {
            ticker.tick().await;
            if !hub.has_connection(&room, id).await {
                break;
            }
            match liveness.tick() {
                Probe::Ping => {
                    if conn.ping().is_err() {
                        log::debug!("Ping to {id} failed");
                        hub.remove_connection(&room, id).await;
                        break;
                    }
                }
                Probe::Dead => {
                    log::warn!("Connection {id} missed its heartbeat, closing");
                    hub.remove_connection(&room, id).await;
                    break;
                }
            }
        }
    })
}
