//! Engine lifecycle controller.
//!
//! [`EngineController`] owns the session state machine:
//!
//! ```text
//! idle → initializing → initialized → starting → started ⇄ paused
//!   ↑                                               │
//!   └───────────────────── stop ────────────────────┘
//! ```
//!
//! `init` runs device discovery and GPS arbitration back to back and only
//! declares the engine initialized once both finish. `start` spawns the
//! measurement loops on first use and flips the recording gate; a repeated
//! `start`, accepted from started or paused as well, only re-enables
//! recording. Pause and resume only touch the gate, the loops keep polling
//! throughout. `stop`
//! tears down every session task and returns the engine to idle, from
//! where a fresh `init` builds a brand-new [`SessionContext`].
//!
//! Out-of-order operations are not errors: they come back as a rejected
//! [`OpOutcome`] naming the state that refused them. Errors are reserved
//! for work that was accepted and then failed.

use crate::config::Settings;
use crate::context::SessionContext;
use crate::discovery::DeviceDiscovery;
use crate::error::{EngineError, EngineResult};
use crate::gps::GpsArbiter;
use crate::measurement::{MeasurementLoop, TechDescriptor};
use crate::model::{Inspection, Role, SlotId};
use crate::publish::{EngineEvent, EventPublisher};
use crate::store::Store;
use crate::transport::LinkFactory;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Initializing,
    Initialized,
    Starting,
    Started,
    Paused,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Starting => "starting",
            LifecycleState::Started => "started",
            LifecycleState::Paused => "paused",
            LifecycleState::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

/// Result of a lifecycle operation. A rejected outcome means the state
/// machine refused the request; it is not an error.
#[derive(Clone, Debug)]
pub struct OpOutcome {
    pub accepted: bool,
    pub message: String,
}

impl OpOutcome {
    fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

/// Point-in-time view of the engine for status queries.
#[derive(Clone, Debug)]
pub struct StatusSnapshot {
    pub state: String,
    pub recording: bool,
    pub open_links: usize,
    pub expert: Option<String>,
    pub kind: Option<String>,
    pub code: Option<String>,
    /// Slot display name to role display name, present after init.
    pub roles: BTreeMap<String, String>,
}

struct ActiveSession {
    inspection: Inspection,
    gps_slot: SlotId,
    assignment: BTreeMap<SlotId, Role>,
    loops_running: bool,
}

pub struct EngineController {
    settings: Arc<Settings>,
    factory: Arc<dyn LinkFactory>,
    store: Arc<dyn Store>,
    publisher: Arc<dyn EventPublisher>,
    state: Mutex<LifecycleState>,
    ctx: Mutex<Arc<SessionContext>>,
    session: Mutex<Option<ActiveSession>>,
}

impl EngineController {
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
            state: Mutex::new(LifecycleState::Idle),
            ctx: Mutex::new(Arc::new(SessionContext::new())),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(LifecycleState::Idle)
    }

    /// The context backing the current session.
    pub fn context(&self) -> Arc<SessionContext> {
        match self.ctx.lock() {
            Ok(ctx) => Arc::clone(&ctx),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn set_state(&self, next: LifecycleState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
        self.publisher.publish(EngineEvent::Status {
            state: next.to_string(),
            at: Utc::now(),
        });
        info!(state = %next, "lifecycle transition");
    }

    /// Atomically claim a transition out of `from`. Returns the rejecting
    /// state when the engine is anywhere else.
    fn claim(&self, from: LifecycleState, to: LifecycleState) -> Result<(), LifecycleState> {
        self.claim_any(&[from], to)
    }

    /// Like [`claim`](Self::claim), but accepting any of several source
    /// states.
    fn claim_any(&self, from: &[LifecycleState], to: LifecycleState) -> Result<(), LifecycleState> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !from.contains(&*state) {
            return Err(*state);
        }
        *state = to;
        drop(state);
        self.publisher.publish(EngineEvent::Status {
            state: to.to_string(),
            at: Utc::now(),
        });
        info!(state = %to, "lifecycle transition");
        Ok(())
    }

    /// Discover the fleet, arbitrate GPS and dispatch the scenario for a
    /// new inspection. Accepted only from idle.
    pub async fn init(
        &self,
        kind: impl Into<String>,
        code: impl Into<String>,
        expert: impl Into<String>,
    ) -> EngineResult<OpOutcome> {
        if let Err(current) = self.claim(LifecycleState::Idle, LifecycleState::Initializing) {
            return Ok(OpOutcome::rejected(format!(
                "init refused while {current}"
            )));
        }

        let inspection = Inspection::new(kind, code, expert);
        self.publisher.publish(EngineEvent::SessionInfo {
            expert: inspection.expert.clone(),
            kind: inspection.kind.clone(),
            code: inspection.code.clone(),
        });

        let ctx = Arc::new(SessionContext::new());
        if let Ok(mut slot) = self.ctx.lock() {
            *slot = Arc::clone(&ctx);
        }

        match self.bring_up(&inspection, &ctx).await {
            Ok((gps_slot, assignment)) => {
                if let Ok(mut session) = self.session.lock() {
                    *session = Some(ActiveSession {
                        inspection,
                        gps_slot,
                        assignment,
                        loops_running: false,
                    });
                }
                self.set_state(LifecycleState::Initialized);
                Ok(OpOutcome::accepted("initialized"))
            }
            Err(e) => {
                warn!(error = %e, "initialization failed");
                ctx.cancel_all();
                self.set_state(LifecycleState::Idle);
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        inspection: &Inspection,
        ctx: &Arc<SessionContext>,
    ) -> EngineResult<(SlotId, BTreeMap<SlotId, Role>)> {
        self.store.create_inspection(inspection.clone()).await?;

        let discovery = DeviceDiscovery::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.factory),
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
        );
        discovery.run(inspection.id, ctx).await?;

        let arbiter = GpsArbiter::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.factory),
            Arc::clone(&self.store),
            Arc::clone(&self.publisher),
        );
        arbiter.run(inspection.id, ctx).await
    }

    /// Begin recording. The first start after init spawns the measurement
    /// loops; a later start, including one issued while paused, finds the
    /// loops already running and only reopens the recording gate.
    pub async fn start(&self) -> EngineResult<OpOutcome> {
        if let Err(current) = self.claim_any(
            &[
                LifecycleState::Initialized,
                LifecycleState::Started,
                LifecycleState::Paused,
            ],
            LifecycleState::Starting,
        ) {
            return Ok(OpOutcome::rejected(format!(
                "start refused while {current}"
            )));
        }

        let launch: Option<(Uuid, BTreeMap<SlotId, Role>)> = match self.session.lock() {
            Ok(mut session) => session.as_mut().and_then(|active| {
                if active.loops_running {
                    None
                } else {
                    active.loops_running = true;
                    Some((active.inspection.id, active.assignment.clone()))
                }
            }),
            Err(_) => None,
        };

        let ctx = self.context();
        if let Some((inspection, assignment)) = launch {
            if let Err(e) = self.spawn_loops(inspection, &assignment, &ctx).await {
                if let Ok(mut session) = self.session.lock() {
                    if let Some(active) = session.as_mut() {
                        active.loops_running = false;
                    }
                }
                self.set_state(LifecycleState::Initialized);
                return Err(e);
            }
        }
        ctx.set_recording(true);
        self.set_state(LifecycleState::Started);
        Ok(OpOutcome::accepted("recording"))
    }

    async fn spawn_loops(
        &self,
        inspection: Uuid,
        assignment: &BTreeMap<SlotId, Role>,
        ctx: &Arc<SessionContext>,
    ) -> EngineResult<()> {
        let mut launched = 0usize;
        for (slot, role) in assignment {
            let Some(technology) = role.technology() else {
                // FTP throughput is assigned but not polled.
                continue;
            };
            let Some(facts) = self.store.find_modem_by_slot(inspection, *slot).await else {
                warn!(slot = %slot, "no modem behind slot, loop not started");
                continue;
            };
            let Some(imsi) = facts.imsi.as_deref() else {
                warn!(slot = %slot, "modem has no IMSI, loop not started");
                continue;
            };
            let Some(operator) = self.settings.operator_for_imsi(imsi) else {
                warn!(slot = %slot, imsi, "no operator for IMSI, loop not started");
                continue;
            };

            let descriptor = TechDescriptor::for_technology(technology, &self.settings.timing)?;
            let task = MeasurementLoop {
                slot: *slot,
                inspection,
                role: *role,
                operator: operator.clone(),
                descriptor,
                device_prefix: self.settings.fleet.device_prefix.clone(),
                baud: self.settings.fleet.baud_rate,
                reopen_interval: self.settings.timing.poll_interval(),
                call_status_interval: self.settings.timing.call_status_interval(),
                factory: Arc::clone(&self.factory),
                store: Arc::clone(&self.store),
                publisher: Arc::clone(&self.publisher),
            };
            let ctx_clone = Arc::clone(ctx);
            ctx.register_timer(tokio::spawn(task.run(ctx_clone)));
            launched += 1;
        }
        if launched == 0 {
            return Err(EngineError::Precondition(
                "no measurement loop could be started".to_string(),
            ));
        }
        info!(loops = launched, "measurement loops running");
        Ok(())
    }

    /// Close the recording gate; every loop keeps polling.
    pub fn pause_recording(&self) -> OpOutcome {
        if let Err(current) = self.claim(LifecycleState::Started, LifecycleState::Paused) {
            return OpOutcome::rejected(format!("pause refused while {current}"));
        }
        self.context().set_recording(false);
        OpOutcome::accepted("paused")
    }

    pub fn resume_recording(&self) -> OpOutcome {
        if let Err(current) = self.claim(LifecycleState::Paused, LifecycleState::Started) {
            return OpOutcome::rejected(format!("resume refused while {current}"));
        }
        self.context().set_recording(true);
        OpOutcome::accepted("recording")
    }

    /// Tear the session down and return to idle. Accepted from any state
    /// except idle itself.
    pub fn stop(&self) -> OpOutcome {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *state == LifecycleState::Idle {
                return OpOutcome::rejected("stop refused while idle");
            }
            *state = LifecycleState::Stopping;
        }
        self.publisher.publish(EngineEvent::Status {
            state: LifecycleState::Stopping.to_string(),
            at: Utc::now(),
        });

        let ctx = self.context();
        ctx.set_recording(false);
        let cancelled = ctx.cancel_all();
        if let Ok(mut session) = self.session.lock() {
            *session = None;
        }
        self.set_state(LifecycleState::Idle);
        OpOutcome::accepted(format!("stopped, {cancelled} tasks cancelled"))
    }

    pub fn status(&self) -> StatusSnapshot {
        let ctx = self.context();
        let (expert, kind, code, roles) = match self.session.lock() {
            Ok(session) => match session.as_ref() {
                Some(active) => (
                    Some(active.inspection.expert.clone()),
                    Some(active.inspection.kind.clone()),
                    Some(active.inspection.code.clone()),
                    active
                        .assignment
                        .iter()
                        .map(|(slot, role)| (slot.to_string(), role.to_string()))
                        .collect(),
                ),
                None => (None, None, None, BTreeMap::new()),
            },
            Err(_) => (None, None, None, BTreeMap::new()),
        };
        StatusSnapshot {
            state: self.state().to_string(),
            recording: ctx.recording(),
            open_links: ctx.gauge.count(),
            expert,
            kind,
            code,
            roles,
        }
    }

    /// The slot elected GPS carrier, once initialized.
    pub fn gps_slot(&self) -> Option<SlotId> {
        self.session
            .lock()
            .ok()
            .and_then(|session| session.as_ref().map(|active| active.gps_slot))
    }

    pub fn current_inspection(&self) -> Option<Uuid> {
        self.session
            .lock()
            .ok()
            .and_then(|session| session.as_ref().map(|active| active.inspection.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ApplicationSettings, FleetSettings, OperatorSettings, TimingSettings,
    };
    use crate::publish::NullPublisher;
    use crate::store::MemoryStore;
    use crate::transport::{nmea_sentence, MockFleet, MockModemProfile};
    use std::time::Duration;

    fn fast_settings() -> Arc<Settings> {
        Arc::new(Settings {
            application: ApplicationSettings {
                name: "drivetest".to_string(),
                log_level: "info".to_string(),
            },
            fleet: FleetSettings {
                device_prefix: "/dev/ttyUSB".to_string(),
                baud_rate: 115_200,
                slots_per_group: 1,
            },
            timing: TimingSettings {
                poll_interval_ms: 50,
                command_delay_ms: 1,
                barrier_timeout_ms: 10_000,
                gsm_query_interval_ms: 40,
                wcdma_query_interval_ms: 40,
                lte_query_interval_ms: 40,
                call_status_interval_ms: 60,
                ..TimingSettings::default()
            },
            operators: vec![
                OperatorSettings {
                    name: "op-a".to_string(),
                    imsi_prefix: "43211".to_string(),
                    home_plmn: "43211".to_string(),
                    dial_number: "09121000000".to_string(),
                },
                OperatorSettings {
                    name: "op-b".to_string(),
                    imsi_prefix: "43235".to_string(),
                    home_plmn: "43235".to_string(),
                    dial_number: "09351000000".to_string(),
                },
            ],
        })
    }

    fn two_slot_fleet() -> MockFleet {
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(SlotId(0), MockModemProfile::basic(1, "43211"));
        fleet.add_slot(
            SlotId(1),
            MockModemProfile::basic(2, "43235").with_gps_track(vec![nmea_sentence(
                "GPRMC,110324.00,A,3542.8080,N,05124.5550,E,12.5,80.0,210826,,,A",
            )]),
        );
        fleet
    }

    fn controller(fleet: MockFleet) -> (EngineController, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let controller = EngineController::new(
            fast_settings(),
            Arc::new(fleet),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(NullPublisher),
        );
        (controller, store)
    }

    #[tokio::test]
    async fn start_is_rejected_before_init() {
        let (controller, _store) = controller(two_slot_fleet());
        let outcome = controller.start().await.expect("start");
        assert!(!outcome.accepted);
        assert_eq!(controller.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn pause_and_resume_are_rejected_outside_their_states() {
        let (controller, _store) = controller(two_slot_fleet());
        assert!(!controller.pause_recording().accepted);
        assert!(!controller.resume_recording().accepted);
        assert!(!controller.stop().accepted);
    }

    #[tokio::test]
    async fn full_lifecycle_round_trip() {
        let (controller, store) = controller(two_slot_fleet());

        let outcome = tokio::time::timeout(
            Duration::from_secs(15),
            controller.init("benchmark", "BM-01", "expert-1"),
        )
        .await
        .expect("init in time")
        .expect("init");
        assert!(outcome.accepted, "{}", outcome.message);
        assert_eq!(controller.state(), LifecycleState::Initialized);
        assert_eq!(controller.gps_slot(), Some(SlotId(1)));

        // A second init must be refused while a session exists.
        let again = controller
            .init("benchmark", "BM-02", "expert-1")
            .await
            .expect("init call");
        assert!(!again.accepted);

        let outcome = controller.start().await.expect("start");
        assert!(outcome.accepted);
        assert_eq!(controller.state(), LifecycleState::Started);
        assert!(controller.context().recording());

        let inspection = controller.current_inspection().expect("inspection");
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let samples = store.samples(inspection).await;
                let fixes = store.fixes(inspection).await;
                if !samples.is_empty() && !fixes.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("samples and fixes in time");

        assert!(controller.pause_recording().accepted);
        assert!(!controller.context().recording());
        assert!(controller.resume_recording().accepted);
        assert!(controller.context().recording());

        let outcome = controller.stop();
        assert!(outcome.accepted);
        assert_eq!(controller.state(), LifecycleState::Idle);
        assert_eq!(controller.context().active_timers(), 0);

        // Idle again, so a fresh init is accepted.
        let fresh = tokio::time::timeout(
            Duration::from_secs(15),
            controller.init("benchmark", "BM-02", "expert-1"),
        )
        .await
        .expect("init in time")
        .expect("init");
        assert!(fresh.accepted, "{}", fresh.message);
        controller.stop();
    }

    #[tokio::test]
    async fn second_start_reenables_recording_without_respawning_loops() {
        let (controller, _store) = controller(two_slot_fleet());
        tokio::time::timeout(
            Duration::from_secs(15),
            controller.init("benchmark", "BM-01", "expert-1"),
        )
        .await
        .expect("init in time")
        .expect("init");

        assert!(controller.start().await.expect("start").accepted);
        let timers = controller.context().active_timers();

        assert!(controller.pause_recording().accepted);
        assert!(!controller.context().recording());

        let outcome = controller.start().await.expect("second start");
        assert!(outcome.accepted, "{}", outcome.message);
        assert_eq!(controller.state(), LifecycleState::Started);
        assert!(controller.context().recording());
        // No second set of loops: the task count can only shrink as
        // short-lived bring-up tasks wind down.
        assert!(controller.context().active_timers() <= timers);

        // A start while already started is idempotent.
        assert!(controller.start().await.expect("third start").accepted);
        assert!(controller.context().recording());
        controller.stop();
    }

    #[tokio::test]
    async fn status_reports_roles_after_init() {
        let (controller, _store) = controller(two_slot_fleet());
        tokio::time::timeout(
            Duration::from_secs(15),
            controller.init("coverage", "CV-7", "expert-2"),
        )
        .await
        .expect("init in time")
        .expect("init");

        let status = controller.status();
        assert_eq!(status.state, "initialized");
        assert_eq!(status.expert.as_deref(), Some("expert-2"));
        assert_eq!(status.code.as_deref(), Some("CV-7"));
        assert_eq!(status.roles.len(), 2);
        assert_eq!(
            status.roles.get("slot1").map(String::as_str),
            Some("gsm-idle")
        );
        controller.stop();
    }
}
