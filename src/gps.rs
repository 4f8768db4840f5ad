//! GPS arbitration and fix persistence.
//!
//! Every modem slot exposes a paired NMEA port and is a GPS candidate. All
//! candidates open concurrently and walk the state machine
//!
//! ```text
//! unopened → opened → gps-enabled → fix-reported → {elected | disabled}
//! ```
//!
//! The first candidate to report a syntactically valid latitude (present,
//! parseable, finite) is elected; the election is irrevocable for the
//! session's lifetime. Every loser disables GPS on its modem and closes
//! both of its paired ports, leaving exactly one candidate running.
//!
//! The winner then streams sentences for the rest of the session. While
//! recording is active each fix is upserted keyed by the device timestamp;
//! a duplicate timestamp with unchanged values is a no-op. Election also
//! resolves the winning modem's SIM operator and triggers scenario
//! dispatch before "initializing done" is signalled.

use crate::config::Settings;
use crate::context::SessionContext;
use crate::error::{EngineError, EngineResult};
use crate::model::{GpsFix, Role, SlotId};
use crate::publish::{EngineEvent, EventPublisher};
use crate::scenario::ScenarioDispatcher;
use crate::store::Store;
use crate::transport::{split_lines, write_command, LinkFactory};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// NMEA sentence parsing
// =============================================================================

/// Distance/velocity fields of one `RMC` sentence.
#[derive(Clone, Debug, PartialEq)]
pub struct RmcSentence {
    /// `hhmmss.ss` device clock.
    pub time: String,
    /// `ddmmyy` device date.
    pub date: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_knots: Option<f64>,
}

impl RmcSentence {
    /// Valid latitude is the election criterion: present and finite.
    pub fn has_valid_latitude(&self) -> bool {
        self.latitude.is_some_and(f64::is_finite)
    }

    pub fn device_time_key(&self) -> String {
        format!("{} {}", self.date, self.time)
    }
}

/// Strip framing and verify the XOR checksum, returning the sentence body.
fn checked_body(line: &str) -> Option<&str> {
    let rest = line.strip_prefix('$')?;
    let (body, checksum) = rest.split_once('*')?;
    let expected = u8::from_str_radix(checksum.trim(), 16).ok()?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    (actual == expected).then_some(body)
}

/// `ddmm.mmmm` plus hemisphere to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f64> {
    if value.is_empty() {
        return None;
    }
    let raw: f64 = value.parse().ok()?;
    if !raw.is_finite() {
        return None;
    }
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Some(decimal),
        "S" | "W" => Some(-decimal),
        _ => None,
    }
}

/// Parse any talker's `RMC` sentence (`$GPRMC`, `$GNRMC`, ...).
pub fn parse_rmc(line: &str) -> Option<RmcSentence> {
    let body = checked_body(line)?;
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 10 || !fields[0].ends_with("RMC") {
        return None;
    }
    Some(RmcSentence {
        time: fields[1].to_string(),
        date: fields[9].to_string(),
        latitude: parse_coordinate(fields[3], fields[4]),
        longitude: parse_coordinate(fields[5], fields[6]),
        speed_knots: fields[7].parse().ok().filter(|v: &f64| v.is_finite()),
    })
}

/// Altitude above mean sea level from a `GGA` sentence.
pub fn parse_gga_altitude(line: &str) -> Option<f64> {
    let body = checked_body(line)?;
    let fields: Vec<&str> = body.split(',').collect();
    if fields.len() < 11 || !fields[0].ends_with("GGA") {
        return None;
    }
    fields[9].parse().ok().filter(|v: &f64| v.is_finite())
}

// =============================================================================
// Candidate state machine
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateState {
    Unopened,
    Opened,
    GpsEnabled,
    FixReported,
    Elected,
    Disabled,
}

/// Shared election slot. Set exactly once.
type ElectionSlot = Arc<Mutex<Option<SlotId>>>;

fn try_elect(election: &ElectionSlot, slot: SlotId) -> bool {
    match election.lock() {
        Ok(mut winner) => {
            if winner.is_none() {
                *winner = Some(slot);
                true
            } else {
                false
            }
        }
        Err(_) => false,
    }
}

// =============================================================================
// Arbiter
// =============================================================================

pub struct GpsArbiter {
    settings: Arc<Settings>,
    factory: Arc<dyn LinkFactory>,
    store: Arc<dyn Store>,
    publisher: Arc<dyn EventPublisher>,
}

impl GpsArbiter {
    pub fn new(
        settings: Arc<Settings>,
        factory: Arc<dyn LinkFactory>,
        store: Arc<dyn Store>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            settings,
            factory,
            store,
            publisher,
        }
    }

    /// Open every candidate, wait for the election, mark the winner
    /// GPS-active and trigger scenario dispatch. Resolves with the elected
    /// slot and the role assignment.
    pub async fn run(
        &self,
        inspection: Uuid,
        ctx: &Arc<SessionContext>,
    ) -> EngineResult<(SlotId, BTreeMap<SlotId, Role>)> {
        let election: ElectionSlot = Arc::new(Mutex::new(None));
        let (winner_tx, mut winner_rx) = watch::channel(None::<SlotId>);
        let winner_tx = Arc::new(winner_tx);

        for index in 0..self.settings.total_slots() {
            let candidate = Candidate {
                slot: SlotId(index),
                inspection,
                settings: Arc::clone(&self.settings),
                factory: Arc::clone(&self.factory),
                store: Arc::clone(&self.store),
                publisher: Arc::clone(&self.publisher),
                election: Arc::clone(&election),
                winner_tx: Arc::clone(&winner_tx),
            };
            let ctx_clone = Arc::clone(ctx);
            ctx.register_timer(tokio::spawn(candidate.run(ctx_clone)));
        }
        info!(
            candidates = self.settings.total_slots(),
            "gps arbitration started"
        );

        let wait = async {
            loop {
                if let Some(slot) = *winner_rx.borrow() {
                    return slot;
                }
                if winner_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        let elected = match self.settings.timing.barrier_timeout() {
            Some(cap) => tokio::time::timeout(cap, wait).await.map_err(|_| {
                EngineError::BarrierTimeout {
                    port: 0,
                    progress: 0.0,
                }
            })?,
            None => wait.await,
        };
        info!(slot = %elected, "gps candidate elected");

        self.store.set_gps_active(inspection, elected).await?;

        // The winning port's paired data port identifies the modem whose
        // SIM operator anchors scenario dispatch.
        let facts = self
            .store
            .find_modem_by_slot(inspection, elected)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("modem behind {elected}")))?;
        let imsi = facts
            .imsi
            .as_deref()
            .ok_or_else(|| EngineError::NotFound(format!("IMSI of modem behind {elected}")))?;
        let operator = self
            .settings
            .operator_for_imsi(imsi)
            .ok_or_else(|| EngineError::NotFound(format!("operator for IMSI {imsi}")))?;
        debug!(operator = %operator.name, "gps port operator resolved");

        let dispatcher = ScenarioDispatcher::new(Arc::clone(&self.settings), Arc::clone(&self.store));
        let assignment = dispatcher.dispatch(inspection, elected).await?;

        Ok((elected, assignment))
    }
}

struct Candidate {
    slot: SlotId,
    inspection: Uuid,
    settings: Arc<Settings>,
    factory: Arc<dyn LinkFactory>,
    store: Arc<dyn Store>,
    publisher: Arc<dyn EventPublisher>,
    election: ElectionSlot,
    winner_tx: Arc<watch::Sender<Option<SlotId>>>,
}

impl Candidate {
    async fn run(self, ctx: Arc<SessionContext>) {
        let data_path = self.slot.data_path(&self.settings.fleet.device_prefix);
        let nmea_path = self.slot.nmea_path(&self.settings.fleet.device_prefix);
        let baud = self.settings.fleet.baud_rate;

        let data_link = match self.factory.open(&data_path, baud) {
            Ok(link) => link,
            Err(e) => {
                warn!(slot = %self.slot, error = %e, "gps candidate data port open failed");
                return;
            }
        };
        ctx.gauge.opened(self.publisher.as_ref());
        let mut data = split_lines(data_link, &data_path);

        let nmea_link = match self.factory.open(&nmea_path, baud) {
            Ok(link) => link,
            Err(e) => {
                warn!(slot = %self.slot, error = %e, "gps candidate nmea port open failed");
                data.reader_task.abort();
                ctx.gauge.closed(self.publisher.as_ref());
                return;
            }
        };
        ctx.gauge.opened(self.publisher.as_ref());
        let mut nmea = split_lines(nmea_link, &nmea_path);

        let mut state = CandidateState::Opened;
        let mut shutdown = ctx.shutdown_signal();
        let mut winner_rx = self.winner_tx.subscribe();
        let mut enable_tick = tokio::time::interval(self.settings.timing.poll_interval());
        enable_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_altitude: Option<f64> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                // Stand down the moment another candidate wins.
                result = winner_rx.changed(), if state != CandidateState::Elected => {
                    if result.is_err() {
                        continue;
                    }
                    if winner_rx.borrow().is_some_and(|winner| winner != self.slot) {
                        state = CandidateState::Disabled;
                        break;
                    }
                }
                // Idempotent enable, re-issued at poll cadence until a fix
                // shows up.
                _ = enable_tick.tick(), if state == CandidateState::Opened
                        || state == CandidateState::GpsEnabled => {
                    if write_command(&mut data.writer, &data_path, "AT+QGPS=1").await.is_err() {
                        warn!(slot = %self.slot, "gps enable write failed");
                        break;
                    }
                    if state == CandidateState::Opened {
                        state = CandidateState::GpsEnabled;
                    }
                }
                line = nmea.lines.recv() => {
                    let Some(line) = line else { break };
                    if let Some(altitude) = parse_gga_altitude(&line) {
                        last_altitude = Some(altitude);
                        continue;
                    }
                    let Some(rmc) = parse_rmc(&line) else { continue };
                    if !rmc.has_valid_latitude() {
                        continue;
                    }
                    if state == CandidateState::GpsEnabled || state == CandidateState::Opened {
                        state = CandidateState::FixReported;
                    }
                    if state == CandidateState::FixReported {
                        if try_elect(&self.election, self.slot) {
                            state = CandidateState::Elected;
                            let _ = self.winner_tx.send(Some(self.slot));
                            info!(slot = %self.slot, "gps fix reported, candidate elected");
                        } else {
                            state = CandidateState::Disabled;
                            break;
                        }
                    }
                    if state == CandidateState::Elected {
                        self.persist_fix(&ctx, &rmc, last_altitude).await;
                    }
                }
                // Data-port chatter (command echoes, OK) is drained so the
                // channel never backs up.
                line = data.lines.recv() => {
                    if line.is_none() {
                        break;
                    }
                }
            }
        }

        if state == CandidateState::Disabled {
            let _ = write_command(&mut data.writer, &data_path, "AT+QGPSEND").await;
            debug!(slot = %self.slot, "gps candidate disabled");
        }
        nmea.reader_task.abort();
        data.reader_task.abort();
        ctx.gauge.closed(self.publisher.as_ref());
        ctx.gauge.closed(self.publisher.as_ref());
    }

    async fn persist_fix(&self, ctx: &SessionContext, rmc: &RmcSentence, altitude: Option<f64>) {
        if !ctx.recording() {
            return;
        }
        let (Some(latitude), Some(longitude)) = (rmc.latitude, rmc.longitude) else {
            return;
        };
        let fix = GpsFix {
            device_time: rmc.device_time_key(),
            received_at: Utc::now(),
            latitude,
            longitude,
            altitude,
            speed_knots: rmc.speed_knots,
        };
        match self.store.upsert_fix(self.inspection, fix.clone()).await {
            Ok(true) => self.publisher.publish(EngineEvent::Fix { fix }),
            Ok(false) => {}
            Err(e) => warn!(slot = %self.slot, error = %e, "fix upsert failed"),
        }
    }
}
