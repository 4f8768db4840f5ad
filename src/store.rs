//! Persistence collaborator.
//!
//! Durable storage is out of scope for the engine; it consumes a simple
//! keyed-upsert/update/find interface over the entities in the data model.
//! [`MemoryStore`] is the reference implementation used by the tests and
//! the demo binary. The only queries the engine ever issues are "find by
//! IMEI/slot" and "nearest fix within a time window".
//!
//! All upserts are idempotent, which is what lets GPS election, scenario
//! dispatch and discovery retries tolerate arbitrary task interleavings
//! without cross-task locking.

use crate::error::{EngineError, EngineResult};
use crate::model::{GpsFix, Inspection, MeasurementSample, ModemFacts, Role, SlotId};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Keyed persistence operations over one inspection's aggregates.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_inspection(&self, inspection: Inspection) -> EngineResult<()>;

    /// Insert a modem row, or field-wise update the existing row for the
    /// same IMEI within the inspection. At most one row per
    /// (inspection, IMEI) ever exists.
    async fn upsert_modem(&self, inspection: Uuid, facts: ModemFacts) -> EngineResult<()>;

    async fn find_modem_by_slot(&self, inspection: Uuid, slot: SlotId) -> Option<ModemFacts>;

    async fn modems(&self, inspection: Uuid) -> Vec<ModemFacts>;

    async fn set_modem_role(&self, inspection: Uuid, imei: &str, role: Role) -> EngineResult<()>;

    async fn set_modem_lock_mode(
        &self,
        inspection: Uuid,
        imei: &str,
        lock_mode: &str,
    ) -> EngineResult<()>;

    /// Mark exactly one slot GPS-active; any previously marked row is
    /// cleared so the single-GPS invariant holds even across retries.
    async fn set_gps_active(&self, inspection: Uuid, slot: SlotId) -> EngineResult<()>;

    /// Deduplicated upsert keyed by the fix's device timestamp. Returns
    /// `true` when a row was written, `false` when the timestamp already
    /// existed with unchanged values.
    async fn upsert_fix(&self, inspection: Uuid, fix: GpsFix) -> EngineResult<bool>;

    /// The fix whose receive time is closest to `at` within a symmetric
    /// window; ties by smallest absolute delta, first-seen on exact ties.
    async fn nearest_fix(
        &self,
        inspection: Uuid,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Option<GpsFix>;

    async fn insert_sample(&self, sample: MeasurementSample) -> EngineResult<()>;

    async fn fixes(&self, inspection: Uuid) -> Vec<GpsFix>;

    async fn samples(&self, inspection: Uuid) -> Vec<MeasurementSample>;
}

#[derive(Default)]
struct InspectionData {
    inspection: Option<Inspection>,
    /// Keyed by IMEI, insertion-ordered via the side vector for
    /// deterministic iteration.
    modems: HashMap<String, ModemFacts>,
    modem_order: Vec<String>,
    /// Keyed by device-time string, insertion-ordered.
    fixes: HashMap<String, GpsFix>,
    fix_order: Vec<String>,
    samples: Vec<MeasurementSample>,
}

/// In-memory store. One coarse async mutex; every operation is a short
/// critical section, which matches the "serialize through the owning
/// store's atomic upsert semantics" concurrency model.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<Uuid, InspectionData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_inspection(&self, inspection: Inspection) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner.entry(inspection.id).or_default();
        if data.inspection.is_some() {
            return Err(EngineError::Store(format!(
                "inspection {} already exists",
                inspection.id
            )));
        }
        data.inspection = Some(inspection);
        Ok(())
    }

    async fn upsert_modem(&self, inspection: Uuid, facts: ModemFacts) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .get_mut(&inspection)
            .ok_or_else(|| EngineError::NotFound(format!("inspection {inspection}")))?;
        match data.modems.get_mut(&facts.imei) {
            Some(existing) => existing.merge_from(&facts),
            None => {
                data.modem_order.push(facts.imei.clone());
                data.modems.insert(facts.imei.clone(), facts);
            }
        }
        Ok(())
    }

    async fn find_modem_by_slot(&self, inspection: Uuid, slot: SlotId) -> Option<ModemFacts> {
        let inner = self.inner.lock().await;
        let data = inner.get(&inspection)?;
        data.modems.values().find(|row| row.slot == slot).cloned()
    }

    async fn modems(&self, inspection: Uuid) -> Vec<ModemFacts> {
        let inner = self.inner.lock().await;
        match inner.get(&inspection) {
            Some(data) => data
                .modem_order
                .iter()
                .filter_map(|imei| data.modems.get(imei))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    async fn set_modem_role(&self, inspection: Uuid, imei: &str, role: Role) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .get_mut(&inspection)
            .ok_or_else(|| EngineError::NotFound(format!("inspection {inspection}")))?;
        let row = data
            .modems
            .get_mut(imei)
            .ok_or_else(|| EngineError::NotFound(format!("modem {imei}")))?;
        row.role = Some(role);
        Ok(())
    }

    async fn set_modem_lock_mode(
        &self,
        inspection: Uuid,
        imei: &str,
        lock_mode: &str,
    ) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .get_mut(&inspection)
            .ok_or_else(|| EngineError::NotFound(format!("inspection {inspection}")))?;
        let row = data
            .modems
            .get_mut(imei)
            .ok_or_else(|| EngineError::NotFound(format!("modem {imei}")))?;
        row.lock_mode = Some(lock_mode.to_string());
        Ok(())
    }

    async fn set_gps_active(&self, inspection: Uuid, slot: SlotId) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .get_mut(&inspection)
            .ok_or_else(|| EngineError::NotFound(format!("inspection {inspection}")))?;
        let mut found = false;
        for row in data.modems.values_mut() {
            row.gps_active = row.slot == slot;
            found |= row.gps_active;
        }
        if found {
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("modem behind {slot}")))
        }
    }

    async fn upsert_fix(&self, inspection: Uuid, fix: GpsFix) -> EngineResult<bool> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .get_mut(&inspection)
            .ok_or_else(|| EngineError::NotFound(format!("inspection {inspection}")))?;
        match data.fixes.get_mut(&fix.device_time) {
            Some(existing) if existing.same_values(&fix) => Ok(false),
            Some(existing) => {
                *existing = fix;
                Ok(true)
            }
            None => {
                data.fix_order.push(fix.device_time.clone());
                data.fixes.insert(fix.device_time.clone(), fix);
                Ok(true)
            }
        }
    }

    async fn nearest_fix(
        &self,
        inspection: Uuid,
        at: DateTime<Utc>,
        window: Duration,
    ) -> Option<GpsFix> {
        let inner = self.inner.lock().await;
        let data = inner.get(&inspection)?;
        let mut best: Option<(Duration, &GpsFix)> = None;
        // Insertion order plus strict-less comparison gives first-seen on
        // exact ties.
        for key in &data.fix_order {
            let fix = data.fixes.get(key)?;
            let delta = (fix.received_at - at).abs();
            if delta > window {
                continue;
            }
            match &best {
                Some((best_delta, _)) if delta >= *best_delta => {}
                _ => best = Some((delta, fix)),
            }
        }
        best.map(|(_, fix)| fix.clone())
    }

    async fn insert_sample(&self, sample: MeasurementSample) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .get_mut(&sample.inspection)
            .ok_or_else(|| EngineError::NotFound(format!("inspection {}", sample.inspection)))?;
        data.samples.push(sample);
        Ok(())
    }

    async fn fixes(&self, inspection: Uuid) -> Vec<GpsFix> {
        let inner = self.inner.lock().await;
        match inner.get(&inspection) {
            Some(data) => data
                .fix_order
                .iter()
                .filter_map(|key| data.fixes.get(key))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    async fn samples(&self, inspection: Uuid) -> Vec<MeasurementSample> {
        let inner = self.inner.lock().await;
        inner
            .get(&inspection)
            .map(|data| data.samples.clone())
            .unwrap_or_default()
    }
}
