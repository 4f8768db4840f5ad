//! Technology measurement loops.
//!
//! One loop per (technology, operator) pairing polls a locked modem for its
//! serving-cell parameters. The per-technology differences are small enough
//! to live in data: a [`TechDescriptor`] carries the lock command, the
//! query command, the poll cadence and the response patterns, and one
//! generic [`MeasurementLoop`] drives any of them.
//!
//! A loop locks its modem to the technology once per connection, then polls
//! `AT+QENG="servingcell"` forever. A serving response becomes a sample
//! (correlated against the nearest GPS fix); a `SEARCH` response becomes a
//! no-coverage placeholder row so the cadence survives in the data. Nothing
//! is persisted while recording is off.
//!
//! Long-call roles additionally probe `AT+CLCC` on an independent cadence
//! and re-dial the operator's test number whenever the call has dropped.
//! The last observed call state is stamped onto every sample the loop
//! produces.

use crate::config::{OperatorSettings, TimingSettings};
use crate::context::SessionContext;
use crate::error::EngineResult;
use crate::matcher::PatternSet;
use crate::model::{
    CallStatus, MeasurementSample, Role, SlotId, Technology, FIX_WINDOW_SECS,
};
use crate::publish::{EngineEvent, EventPublisher};
use crate::store::Store;
use crate::transport::{split_lines, write_command, LinkChannels, LinkFactory};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SERVING: &str = "serving";
const SEARCHING: &str = "searching";

/// Everything that differs between the GSM, WCDMA and LTE loops.
pub struct TechDescriptor {
    pub technology: Technology,
    pub lock_command: String,
    pub query_command: String,
    pub poll_interval: Duration,
    patterns: PatternSet,
    /// Field names of the serving pattern, used to shape no-coverage rows.
    pub field_names: Vec<String>,
}

impl TechDescriptor {
    pub fn for_technology(
        technology: Technology,
        timing: &TimingSettings,
    ) -> EngineResult<Self> {
        match technology {
            Technology::Gsm => Self::gsm(timing),
            Technology::Wcdma => Self::wcdma(timing),
            Technology::Lte => Self::lte(timing),
        }
    }

    pub fn gsm(timing: &TimingSettings) -> EngineResult<Self> {
        Self::build(
            Technology::Gsm,
            r#"AT+QCFG="nwscanmode",1,1"#,
            Duration::from_millis(timing.gsm_query_interval_ms),
            // Signal fields can read "-" while the modem settles, hence the
            // permissive tail captures.
            r#"\+QENG:\s*"servingcell","\w+","GSM",(?P<mcc>\d+),(?P<mnc>\d+),(?P<lac>\w+),(?P<cellid>\w+),(?P<bsic>-?\w+),(?P<arfcn>-?\w+),(?P<rxlev>-?\w+)"#,
            &["mcc", "mnc", "lac", "cellid", "bsic", "arfcn", "rxlev"],
        )
    }

    pub fn wcdma(timing: &TimingSettings) -> EngineResult<Self> {
        Self::build(
            Technology::Wcdma,
            r#"AT+QCFG="nwscanmode",2,1"#,
            Duration::from_millis(timing.wcdma_query_interval_ms),
            r#"\+QENG:\s*"servingcell","\w+","WCDMA",(?P<mcc>\d+),(?P<mnc>\d+),(?P<lac>\w+),(?P<cellid>\w+),(?P<uarfcn>-?\w+),(?P<psc>-?\w+),(?P<rscp>-?\w+),(?P<ecio>-?\w+)"#,
            &["mcc", "mnc", "lac", "cellid", "uarfcn", "psc", "rscp", "ecio"],
        )
    }

    pub fn lte(timing: &TimingSettings) -> EngineResult<Self> {
        Self::build(
            Technology::Lte,
            r#"AT+QCFG="nwscanmode",3,1"#,
            Duration::from_millis(timing.lte_query_interval_ms),
            r#"\+QENG:\s*"servingcell","\w+","LTE","(?P<duplex>\w+)",(?P<mcc>\d+),(?P<mnc>\d+),(?P<cellid>\w+),(?P<pcid>-?\w+),(?P<earfcn>-?\w+),(?P<band>-?\w+),(?P<rsrp>-?\w+),(?P<rsrq>-?\w+),(?P<rssi>-?\w+),(?P<sinr>-?\w+)"#,
            &[
                "duplex", "mcc", "mnc", "cellid", "pcid", "earfcn", "band", "rsrp", "rsrq",
                "rssi", "sinr",
            ],
        )
    }

    fn build(
        technology: Technology,
        lock_command: &str,
        poll_interval: Duration,
        serving_pattern: &str,
        field_names: &[&str],
    ) -> EngineResult<Self> {
        let patterns = PatternSet::compile(&[
            (SERVING, serving_pattern),
            (SEARCHING, r#"\+QENG:\s*"servingcell","SEARCH""#),
        ])?;
        Ok(Self {
            technology,
            lock_command: lock_command.to_string(),
            query_command: r#"AT+QENG="servingcell""#.to_string(),
            poll_interval,
            patterns,
            field_names: field_names.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn classify(&self, line: &str) -> Option<(bool, BTreeMap<String, String>)> {
        if let Some(hit) = self.patterns.match_named(SERVING, line) {
            return Some((true, hit.fields));
        }
        if self.patterns.match_named(SEARCHING, line).is_some() {
            return Some((false, BTreeMap::new()));
        }
        None
    }
}

/// Long-call probe state across one `AT+CLCC` exchange. The command echo
/// opens the window, `OK` closes it.
struct CallProbe {
    in_response: bool,
    saw_active_call: bool,
    last_status: CallStatus,
}

impl CallProbe {
    fn new() -> Self {
        Self {
            in_response: false,
            saw_active_call: false,
            last_status: CallStatus::Idle,
        }
    }
}

/// One polling loop for one modem slot.
pub struct MeasurementLoop {
    pub slot: SlotId,
    pub inspection: Uuid,
    pub role: Role,
    pub operator: OperatorSettings,
    pub descriptor: TechDescriptor,
    pub device_prefix: String,
    pub baud: u32,
    /// Reopen cadence after a lost link.
    pub reopen_interval: Duration,
    pub call_status_interval: Duration,
    pub factory: Arc<dyn LinkFactory>,
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn EventPublisher>,
}

impl MeasurementLoop {
    /// Run until shutdown. Infallible by contract; transport loss reopens
    /// the port and re-asserts the technology lock.
    pub async fn run(self, ctx: Arc<SessionContext>) {
        let path = self.slot.data_path(&self.device_prefix);
        let mut shutdown = ctx.shutdown_signal();
        let mut reopen = tokio::time::interval(self.reopen_interval);
        reopen.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !*shutdown.borrow() {
            let link = match self.factory.open(&path, self.baud) {
                Ok(link) => link,
                Err(e) => {
                    warn!(slot = %self.slot, error = %e, "measurement port open failed");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = reopen.tick() => continue,
                    }
                }
            };
            ctx.gauge.opened(self.publisher.as_ref());
            let mut channels = split_lines(link, &path);

            let lost = if self.assert_lock(&mut channels, &path).await.is_ok() {
                self.poll(&mut channels, &path, &ctx, &mut shutdown).await
            } else {
                true
            };
            channels.reader_task.abort();
            ctx.gauge.closed(self.publisher.as_ref());
            if !lost {
                break;
            }
            debug!(slot = %self.slot, "measurement link lost, will reopen");
            // Reopen at the same cadence as a failed open; an instantly
            // dying link must not spin the loop.
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = reopen.tick() => {}
            }
        }
        info!(slot = %self.slot, role = %self.role, "measurement loop finished");
    }

    /// Lock the modem to this loop's technology and record the lock.
    async fn assert_lock(&self, channels: &mut LinkChannels, path: &str) -> EngineResult<()> {
        write_command(&mut channels.writer, path, &self.descriptor.lock_command).await?;
        if let Some(facts) = self.store.find_modem_by_slot(self.inspection, self.slot).await {
            let mode = self.descriptor.technology.to_string();
            if let Err(e) = self
                .store
                .set_modem_lock_mode(self.inspection, &facts.imei, &mode)
                .await
            {
                warn!(slot = %self.slot, error = %e, "lock mode not recorded");
            }
        }
        self.publisher.publish(EngineEvent::LockState {
            technology: self.descriptor.technology,
            operator: self.operator.name.clone(),
            locked: true,
        });
        info!(
            slot = %self.slot,
            technology = %self.descriptor.technology,
            operator = %self.operator.name,
            "technology lock asserted"
        );
        Ok(())
    }

    /// Returns `true` when the link was lost (caller reopens), `false` on
    /// shutdown.
    async fn poll(
        &self,
        channels: &mut LinkChannels,
        path: &str,
        ctx: &SessionContext,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut query = tokio::time::interval(self.descriptor.poll_interval);
        query.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut call = tokio::time::interval(self.call_status_interval);
        call.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut probe = CallProbe::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
                _ = query.tick() => {
                    if write_command(&mut channels.writer, path, &self.descriptor.query_command)
                        .await
                        .is_err()
                    {
                        return true;
                    }
                }
                _ = call.tick(), if self.role.is_long_call() => {
                    if write_command(&mut channels.writer, path, "AT+CLCC").await.is_err() {
                        return true;
                    }
                }
                line = channels.lines.recv() => {
                    let Some(line) = line else { return true };
                    if self.handle_line(&line, channels, path, ctx, &mut probe).await.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    async fn handle_line(
        &self,
        line: &str,
        channels: &mut LinkChannels,
        path: &str,
        ctx: &SessionContext,
        probe: &mut CallProbe,
    ) -> EngineResult<()> {
        if self.role.is_long_call() {
            self.track_call(line, channels, path, probe).await?;
        }

        let Some((serving, fields)) = self.descriptor.classify(line) else {
            return Ok(());
        };
        if !ctx.recording() {
            return Ok(());
        }

        let created_at = Utc::now();
        let sample = if serving {
            let fix_ref = self
                .store
                .nearest_fix(
                    self.inspection,
                    created_at,
                    chrono::Duration::seconds(FIX_WINDOW_SECS),
                )
                .await
                .map(|fix| fix.device_time);
            MeasurementSample {
                id: Uuid::new_v4(),
                inspection: self.inspection,
                technology: self.descriptor.technology,
                operator: self.operator.name.clone(),
                role: self.role,
                fields,
                fix_ref,
                call_status: self.role.is_long_call().then_some(probe.last_status),
                created_at,
            }
        } else {
            let mut sample = MeasurementSample::no_coverage(
                self.inspection,
                self.descriptor.technology,
                self.operator.name.clone(),
                self.role,
                &self.descriptor.field_names,
                created_at,
            );
            sample.call_status = self.role.is_long_call().then_some(probe.last_status);
            sample
        };

        match self.store.insert_sample(sample.clone()).await {
            Ok(()) => self.publisher.publish(EngineEvent::Sample {
                technology: self.descriptor.technology,
                operator: self.operator.name.clone(),
                sample,
            }),
            Err(e) => warn!(slot = %self.slot, error = %e, "sample insert failed"),
        }
        Ok(())
    }

    /// Walk one `AT+CLCC` exchange. An idle result dials the operator's
    /// test number straight away.
    async fn track_call(
        &self,
        line: &str,
        channels: &mut LinkChannels,
        path: &str,
        probe: &mut CallProbe,
    ) -> EngineResult<()> {
        if line == "AT+CLCC" {
            probe.in_response = true;
            probe.saw_active_call = false;
            return Ok(());
        }
        if !probe.in_response {
            return Ok(());
        }
        if line.starts_with("+CLCC:") {
            // <stat> 0 is an active call.
            let stat = line
                .split(',')
                .nth(2)
                .map(str::trim)
                .unwrap_or_default();
            if stat == "0" {
                probe.saw_active_call = true;
            }
            return Ok(());
        }
        if line == "OK" || line == "ERROR" {
            probe.in_response = false;
            if probe.saw_active_call {
                probe.last_status = CallStatus::Dedicated;
            } else {
                probe.last_status = CallStatus::Idle;
                debug!(slot = %self.slot, number = %self.operator.dial_number, "redialing");
                write_command(
                    &mut channels.writer,
                    path,
                    &format!("ATD{};", self.operator.dial_number),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimingSettings;
    use crate::model::{Inspection, ModemFacts};
    use crate::publish::NullPublisher;
    use crate::store::MemoryStore;
    use crate::transport::{MockFleet, MockModemProfile, RawLink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_timing() -> TimingSettings {
        TimingSettings {
            poll_interval_ms: 50,
            command_delay_ms: 1,
            gsm_query_interval_ms: 30,
            wcdma_query_interval_ms: 30,
            lte_query_interval_ms: 30,
            call_status_interval_ms: 40,
            ..TimingSettings::default()
        }
    }

    fn operator() -> OperatorSettings {
        OperatorSettings {
            name: "op-a".to_string(),
            imsi_prefix: "43211".to_string(),
            home_plmn: "43211".to_string(),
            dial_number: "09121000000".to_string(),
        }
    }

    async fn seeded_store(slot: SlotId, imei: &str) -> (Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let inspection = Inspection::new("benchmark", "BM-01", "expert-1");
        let id = inspection.id;
        store.create_inspection(inspection).await.expect("create");
        store
            .upsert_modem(id, ModemFacts::new(slot, imei))
            .await
            .expect("modem");
        (store, id)
    }

    fn loop_for(
        slot: SlotId,
        inspection: Uuid,
        role: Role,
        descriptor: TechDescriptor,
        factory: Arc<dyn LinkFactory>,
        store: Arc<MemoryStore>,
    ) -> MeasurementLoop {
        MeasurementLoop {
            slot,
            inspection,
            role,
            operator: operator(),
            descriptor,
            device_prefix: "/dev/ttyUSB".to_string(),
            baud: 115_200,
            reopen_interval: Duration::from_millis(50),
            call_status_interval: Duration::from_millis(40),
            factory,
            store,
            publisher: Arc::new(NullPublisher),
        }
    }

    #[test]
    fn gsm_pattern_parses_a_serving_response() {
        let descriptor = TechDescriptor::gsm(&fast_timing()).expect("descriptor");
        let line = "+QENG: \"servingcell\",\"NOCONN\",\"GSM\",432,11,2F3A,0C81,33,77,-71";
        let (serving, fields) = descriptor.classify(line).expect("classified");
        assert!(serving);
        assert_eq!(fields.get("mcc").map(String::as_str), Some("432"));
        assert_eq!(fields.get("cellid").map(String::as_str), Some("0C81"));
        assert_eq!(fields.get("rxlev").map(String::as_str), Some("-71"));
    }

    #[test]
    fn lte_pattern_parses_a_serving_response() {
        let descriptor = TechDescriptor::lte(&fast_timing()).expect("descriptor");
        let line = "+QENG: \"servingcell\",\"NOCONN\",\"LTE\",\"FDD\",432,11,5F01A02,215,1850,3,-95,-11,-63,12";
        let (serving, fields) = descriptor.classify(line).expect("classified");
        assert!(serving);
        assert_eq!(fields.get("rsrp").map(String::as_str), Some("-95"));
        assert_eq!(fields.get("sinr").map(String::as_str), Some("12"));
    }

    #[test]
    fn search_response_is_no_coverage() {
        let descriptor = TechDescriptor::wcdma(&fast_timing()).expect("descriptor");
        let (serving, fields) = descriptor
            .classify("+QENG: \"servingcell\",\"SEARCH\"")
            .expect("classified");
        assert!(!serving);
        assert!(fields.is_empty());
    }

    #[tokio::test]
    async fn loop_records_samples_while_recording() {
        let slot = SlotId(0);
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(slot, MockModemProfile::basic(1, "43211"));
        let factory: Arc<dyn LinkFactory> = Arc::new(fleet);
        let (store, inspection) = seeded_store(slot, "868981030001001").await;

        let ctx = Arc::new(SessionContext::new());
        ctx.set_recording(true);

        let descriptor = TechDescriptor::gsm(&fast_timing()).expect("descriptor");
        let task_loop = loop_for(
            slot,
            inspection,
            Role::GsmIdle,
            descriptor,
            factory,
            Arc::clone(&store),
        );
        let ctx_clone = Arc::clone(&ctx);
        ctx.register_timer(tokio::spawn(task_loop.run(ctx_clone)));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !store.samples(inspection).await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("samples in time");

        let samples = store.samples(inspection).await;
        assert_eq!(samples[0].technology, Technology::Gsm);
        assert_eq!(samples[0].operator, "op-a");
        assert_eq!(samples[0].fields.get("mcc").map(String::as_str), Some("432"));
        assert!(samples[0].call_status.is_none());
        ctx.cancel_all();
    }

    #[tokio::test]
    async fn nothing_is_recorded_while_recording_is_off() {
        let slot = SlotId(0);
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(slot, MockModemProfile::basic(1, "43211"));
        let factory: Arc<dyn LinkFactory> = Arc::new(fleet);
        let (store, inspection) = seeded_store(slot, "868981030001001").await;

        let ctx = Arc::new(SessionContext::new());
        let descriptor = TechDescriptor::gsm(&fast_timing()).expect("descriptor");
        let task_loop = loop_for(
            slot,
            inspection,
            Role::GsmIdle,
            descriptor,
            factory,
            Arc::clone(&store),
        );
        let ctx_clone = Arc::clone(&ctx);
        ctx.register_timer(tokio::spawn(task_loop.run(ctx_clone)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.samples(inspection).await.is_empty());
        ctx.cancel_all();
    }

    #[tokio::test]
    async fn long_call_loop_redials_and_stamps_call_status() {
        let slot = SlotId(0);
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(slot, MockModemProfile::basic(1, "43211"));
        let factory: Arc<dyn LinkFactory> = Arc::new(fleet);
        let (store, inspection) = seeded_store(slot, "868981030001001").await;

        let ctx = Arc::new(SessionContext::new());
        ctx.set_recording(true);

        let descriptor = TechDescriptor::gsm(&fast_timing()).expect("descriptor");
        let task_loop = loop_for(
            slot,
            inspection,
            Role::GsmLongCall,
            descriptor,
            factory,
            Arc::clone(&store),
        );
        let ctx_clone = Arc::clone(&ctx);
        ctx.register_timer(tokio::spawn(task_loop.run(ctx_clone)));

        // The first probe finds no call and dials; once the mock answers,
        // samples carry the dedicated state.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let dedicated = store
                    .samples(inspection)
                    .await
                    .iter()
                    .any(|s| s.call_status == Some(CallStatus::Dedicated));
                if dedicated {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("dedicated sample in time");

        for sample in store.samples(inspection).await {
            assert!(sample.call_status.is_some());
        }
        ctx.cancel_all();
    }

    struct DeadLinkFactory {
        opens: Arc<AtomicUsize>,
    }

    impl LinkFactory for DeadLinkFactory {
        fn open(&self, _path: &str, _baud: u32) -> EngineResult<Box<dyn RawLink>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            // Device side dropped, so the first write fails.
            let (host, _) = tokio::io::duplex(64);
            Ok(Box::new(host))
        }
    }

    #[tokio::test]
    async fn dead_link_reopens_at_cadence_not_in_a_tight_loop() {
        let slot = SlotId(0);
        let opens = Arc::new(AtomicUsize::new(0));
        let factory: Arc<dyn LinkFactory> = Arc::new(DeadLinkFactory {
            opens: Arc::clone(&opens),
        });
        let (store, inspection) = seeded_store(slot, "868981030001001").await;

        let ctx = Arc::new(SessionContext::new());
        let descriptor = TechDescriptor::gsm(&fast_timing()).expect("descriptor");
        let task_loop = loop_for(slot, inspection, Role::GsmIdle, descriptor, factory, store);
        let ctx_clone = Arc::clone(&ctx);
        ctx.register_timer(tokio::spawn(task_loop.run(ctx_clone)));

        tokio::time::sleep(Duration::from_millis(230)).await;
        ctx.cancel_all();

        // 230 ms against a 50 ms reopen cadence: a spinning loop would
        // rack up thousands of opens.
        let count = opens.load(Ordering::SeqCst);
        assert!((2..=8).contains(&count), "reopened {count} times");
    }

    #[tokio::test]
    async fn samples_reference_the_nearest_fix() {
        use crate::model::GpsFix;

        let slot = SlotId(0);
        let mut fleet = MockFleet::new("/dev/ttyUSB");
        fleet.add_slot(slot, MockModemProfile::basic(1, "43211"));
        let factory: Arc<dyn LinkFactory> = Arc::new(fleet);
        let (store, inspection) = seeded_store(slot, "868981030001001").await;

        store
            .upsert_fix(
                inspection,
                GpsFix {
                    device_time: "210826 110324.00".to_string(),
                    received_at: Utc::now(),
                    latitude: 35.713,
                    longitude: 51.409,
                    altitude: Some(1180.0),
                    speed_knots: Some(12.5),
                },
            )
            .await
            .expect("fix");

        let ctx = Arc::new(SessionContext::new());
        ctx.set_recording(true);

        let descriptor = TechDescriptor::gsm(&fast_timing()).expect("descriptor");
        let task_loop = loop_for(
            slot,
            inspection,
            Role::GsmIdle,
            descriptor,
            factory,
            Arc::clone(&store),
        );
        let ctx_clone = Arc::clone(&ctx);
        ctx.register_timer(tokio::spawn(task_loop.run(ctx_clone)));

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !store.samples(inspection).await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("samples in time");

        let samples = store.samples(inspection).await;
        assert_eq!(
            samples[0].fix_ref.as_deref(),
            Some("210826 110324.00"),
            "sample should carry the fix key"
        );
        ctx.cancel_all();
    }
}
