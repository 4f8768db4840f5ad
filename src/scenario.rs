//! Scenario assignment.
//!
//! After GPS election every modem gets exactly one measurement role. The
//! fleet is partitioned by SIM operator prefix into two groups; within the
//! group that contains the elected GPS slot, that slot is forced into the
//! GSM-idle role and the remaining slots are assigned in the fixed
//! priority order. The other group receives all six roles in priority
//! order, independent of GPS ownership.
//!
//! Assignment is deterministic and order-sensitive: slots are taken in
//! ascending slot order, so re-running with the same inputs produces the
//! same mapping.

use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::model::{ModemFacts, Role, SlotId};
use crate::store::Store;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Pure assignment over already-partitioned groups. `gps_slot` must be a
/// member of exactly one group.
pub fn assign_roles(
    groups: &BTreeMap<String, Vec<SlotId>>,
    gps_slot: SlotId,
) -> BTreeMap<SlotId, Role> {
    let mut assignment = BTreeMap::new();

    for slots in groups.values() {
        let mut ordered: Vec<SlotId> = slots.clone();
        ordered.sort();

        let mut remaining_roles = Role::PRIORITY.to_vec();
        if ordered.contains(&gps_slot) {
            // The GPS-bearing slot is pinned to GSM idle; the rest of its
            // group takes the remaining roles in priority order.
            assignment.insert(gps_slot, Role::GsmIdle);
            remaining_roles.retain(|role| *role != Role::GsmIdle);
            ordered.retain(|slot| *slot != gps_slot);
        }

        for (slot, role) in ordered.into_iter().zip(remaining_roles) {
            assignment.insert(slot, role);
        }
    }

    assignment
}

/// Partitions the fleet from the store, assigns roles and records each
/// role back onto its `ModemFacts` row.
pub struct ScenarioDispatcher {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
}

impl ScenarioDispatcher {
    pub fn new(settings: Arc<Settings>, store: Arc<dyn Store>) -> Self {
        Self { settings, store }
    }

    pub async fn dispatch(
        &self,
        inspection: Uuid,
        gps_slot: SlotId,
    ) -> EngineResult<BTreeMap<SlotId, Role>> {
        let modems = self.store.modems(inspection).await;
        if modems.is_empty() {
            return Err(EngineError::NotFound(format!(
                "no modems discovered in inspection {inspection}"
            )));
        }

        let groups = self.partition(&modems);
        let assignment = assign_roles(&groups, gps_slot);

        for modem in &modems {
            match assignment.get(&modem.slot) {
                Some(role) => {
                    self.store
                        .set_modem_role(inspection, &modem.imei, *role)
                        .await?;
                }
                None => warn!(slot = %modem.slot, "modem left without a role"),
            }
        }
        info!(roles = assignment.len(), "scenario dispatch complete");
        Ok(assignment)
    }

    fn partition(&self, modems: &[ModemFacts]) -> BTreeMap<String, Vec<SlotId>> {
        let mut groups: BTreeMap<String, Vec<SlotId>> = BTreeMap::new();
        for modem in modems {
            let Some(imsi) = modem.imsi.as_deref() else {
                warn!(slot = %modem.slot, "modem has no IMSI, excluded from dispatch");
                continue;
            };
            match self.settings.operator_for_imsi(imsi) {
                Some(operator) => groups
                    .entry(operator.name.clone())
                    .or_default()
                    .push(modem.slot),
                None => warn!(slot = %modem.slot, imsi, "no operator matches IMSI prefix"),
            }
        }
        groups
    }
}
