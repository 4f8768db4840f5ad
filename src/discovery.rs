//! Device discovery.
//!
//! Drives one [`PortSession`] per modem data port through the full
//! bring-up battery, all ports concurrently, and waits on every port's
//! progress barrier before declaring discovery complete. On completion one
//! `ModemFacts` row per IMEI is upserted into the inspection: insert if
//! absent, field-wise update if a prior row exists, which handles modems
//! that answer late across retries.
//!
//! The battery, in flag order:
//!
//! 1. identify module (model + firmware revision), then pin command echo
//!    on with `ATE1`; every later pattern anchors on the echo
//! 2. read IMEI
//! 3. read IMSI
//! 4. read SIM status
//! 5. clear on-device message storage
//! 6. enable full functionality
//! 7. deactivate the default data context
//! 8. read the registered network, forcing automatic selection when the
//!    registered PLMN is foreign
//! 9. set "all technologies" scan mode
//! 10. read call status, hanging up any stray call
//!
//! Steps 1, 8 and 10 fire follow-up commands the moment their flag is
//! satisfied instead of waiting for the next poll tick: `ATE1`
//! unconditionally, `AT+COPS=0` and `ATH` only when the captured field
//! calls for them.

use crate::barrier;
use crate::config::Settings;
use crate::context::SessionContext;
use crate::error::EngineResult;
use crate::matcher::PatternSet;
use crate::model::{ModemFacts, SlotId};
use crate::publish::EventPublisher;
use crate::session::{CommandFlag, FollowUp, PortSession, SessionHandle, SessionTiming};
use crate::store::Store;
use crate::transport::LinkFactory;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Flag and pattern names of the bring-up battery.
mod flag {
    pub const IDENTIFY: &str = "identify";
    pub const IMEI: &str = "imei";
    pub const IMSI: &str = "imsi";
    pub const SIM_STATUS: &str = "sim_status";
    pub const STORAGE_CLEARED: &str = "storage_cleared";
    pub const FULL_FUNCTION: &str = "full_function";
    pub const CONTEXT_DEACTIVATED: &str = "context_deactivated";
    pub const NETWORK_CHECKED: &str = "network_checked";
    pub const SCAN_ALL: &str = "scan_all";
    pub const CALL_STATUS: &str = "call_status";
}

/// Build the discovery battery. `home_plmns` are the numeric operator
/// codes considered "not foreign" by the registered-network check.
pub fn battery(home_plmns: &[String]) -> EngineResult<(Vec<CommandFlag>, PatternSet)> {
    let flags = vec![
        CommandFlag::new(flag::IDENTIFY, "ATI")
            .with_follow_up(FollowUp::Always("ATE1".to_string())),
        CommandFlag::new(flag::IMEI, "AT+CGSN"),
        CommandFlag::new(flag::IMSI, "AT+CIMI"),
        CommandFlag::new(flag::SIM_STATUS, "AT+CPIN?"),
        CommandFlag::new(flag::STORAGE_CLEARED, "AT+CMGD=1,4"),
        CommandFlag::new(flag::FULL_FUNCTION, "AT+CFUN=1"),
        CommandFlag::new(flag::CONTEXT_DEACTIVATED, "AT+CGACT=0,1"),
        CommandFlag::new(flag::NETWORK_CHECKED, "AT+COPS?").with_follow_up(
            FollowUp::IfFieldNotIn {
                field: "plmn".to_string(),
                allowed: home_plmns.to_vec(),
                command: "AT+COPS=0".to_string(),
            },
        ),
        CommandFlag::new(flag::SCAN_ALL, "AT+QCFG=\"nwscanmode\",0,1"),
        CommandFlag::new(flag::CALL_STATUS, "AT+CLCC").with_follow_up(FollowUp::IfFieldNotIn {
            field: "calls".to_string(),
            allowed: vec![String::new()],
            command: "ATH".to_string(),
        }),
    ];

    // Bare-number responses (IMEI, IMSI) anchor on the command echo so the
    // two cannot satisfy each other's flag.
    let patterns = PatternSet::compile(&[
        (
            flag::IDENTIFY,
            r"Quectel\s+(?P<model>\S+)\s+Revision:\s*(?P<revision>\S+)",
        ),
        (flag::IMEI, r"AT\+CGSN\s+(?P<imei>\d{15})"),
        (flag::IMSI, r"AT\+CIMI\s+(?P<imsi>\d{14,15})"),
        (flag::SIM_STATUS, r"\+CPIN:\s*(?P<sim>[A-Z][A-Z ]*)"),
        (flag::STORAGE_CLEARED, r"AT\+CMGD=1,4\s+OK"),
        (flag::FULL_FUNCTION, r"AT\+CFUN=1\s+OK"),
        (flag::CONTEXT_DEACTIVATED, r"AT\+CGACT=0,1\s+OK"),
        (
            flag::NETWORK_CHECKED,
            r#"\+COPS:\s*\d+,\d+,"(?P<plmn>\d+)""#,
        ),
        (flag::SCAN_ALL, r#"AT\+QCFG="nwscanmode",0,1\s+OK"#),
        (
            flag::CALL_STATUS,
            r"AT\+CLCC\s+(?P<calls>(?:\+CLCC:[^\n]*\n)*)OK",
        ),
    ])?;

    Ok((flags, patterns))
}

/// Runs the bring-up battery across the whole fleet.
pub struct DeviceDiscovery {
    settings: Arc<Settings>,
    factory: Arc<dyn LinkFactory>,
    store: Arc<dyn Store>,
    publisher: Arc<dyn EventPublisher>,
}

impl DeviceDiscovery {
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

    /// Discover every slot concurrently and upsert one `ModemFacts` row per
    /// IMEI. Resolves when every port's barrier releases.
    pub async fn run(&self, inspection: Uuid, ctx: &Arc<SessionContext>) -> EngineResult<()> {
        let home_plmns: Vec<String> = self
            .settings
            .operators
            .iter()
            .map(|operator| operator.home_plmn.clone())
            .collect();
        let timing = SessionTiming {
            poll_interval: self.settings.timing.poll_interval(),
            command_delay: self.settings.timing.command_delay(),
        };

        let mut handles: Vec<(SlotId, SessionHandle)> = Vec::new();
        for index in 0..self.settings.total_slots() {
            let slot = SlotId(index);
            let (flags, patterns) = battery(&home_plmns)?;
            let (session, handle) = PortSession::new(
                slot.data_port_index(),
                slot.data_path(&self.settings.fleet.device_prefix),
                self.settings.fleet.baud_rate,
                flags,
                patterns,
                timing,
                Arc::clone(&self.factory),
            );
            let shutdown = ctx.shutdown_signal();
            let publisher = Arc::clone(&self.publisher);
            let gauge = Arc::clone(&ctx.gauge);
            ctx.register_timer(tokio::spawn(session.run(shutdown, publisher, gauge)));
            handles.push((slot, handle));
        }

        info!(slots = handles.len(), "device discovery started");
        let session_handles: Vec<SessionHandle> =
            handles.iter().map(|(_, handle)| handle.clone()).collect();
        barrier::await_all(
            &session_handles,
            self.publisher.as_ref(),
            self.settings.timing.barrier_timeout(),
        )
        .await?;

        for (slot, handle) in &handles {
            match self.facts_from(*slot, handle) {
                Some(facts) => self.store.upsert_modem(inspection, facts).await?,
                None => warn!(%slot, "discovery finished without an IMEI"),
            }
        }
        info!("device discovery complete");
        Ok(())
    }

    fn facts_from(&self, slot: SlotId, handle: &SessionHandle) -> Option<ModemFacts> {
        let imei = handle.captured(flag::IMEI, "imei")?;
        let mut facts = ModemFacts::new(slot, imei);
        facts.model = handle.captured(flag::IDENTIFY, "model");
        facts.revision = handle.captured(flag::IDENTIFY, "revision");
        facts.imsi = handle.captured(flag::IMSI, "imsi");
        facts.sim_state = handle.captured(flag::SIM_STATUS, "sim");
        // The call-status flag only satisfies on a well-formed +CLCC
        // response, so its presence is the capability signal.
        facts.call_capable = {
            let captures = handle.captures.lock().ok()?;
            captures.contains_key(flag::CALL_STATUS)
        };
        Some(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_compiles_and_has_ten_flags() {
        let (flags, patterns) = battery(&["43211".to_string()]).expect("battery");
        assert_eq!(flags.len(), 10);
        assert_eq!(patterns.names().count(), 10);
    }

    #[test]
    fn network_pattern_extracts_plmn() {
        let (_, patterns) = battery(&["43211".to_string()]).expect("battery");
        let buffer = "AT+COPS?\n+COPS: 0,2,\"43235\",7\nOK\n";
        let hit = patterns
            .match_named(flag::NETWORK_CHECKED, buffer)
            .expect("match");
        assert_eq!(hit.fields.get("plmn").map(String::as_str), Some("43235"));
    }

    #[test]
    fn call_status_pattern_distinguishes_active_calls() {
        let (_, patterns) = battery(&[]).expect("battery");

        let idle = "AT+CLCC\nOK\n";
        let hit = patterns.match_named(flag::CALL_STATUS, idle).expect("match");
        assert_eq!(hit.fields.get("calls").map(String::as_str), Some(""));

        let active = "AT+CLCC\n+CLCC: 1,0,0,0,0,\"\",129\nOK\n";
        let hit = patterns
            .match_named(flag::CALL_STATUS, active)
            .expect("match");
        assert!(hit.fields.get("calls").is_some_and(|v| !v.is_empty()));
    }

}
