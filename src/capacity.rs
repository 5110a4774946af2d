/// Appointment capacity ledger.
///
/// Capacity is configured per location and time slot through `CapacitySlot`
/// definitions, optionally restricted to a weekday and a date window. For
/// each (definition, date) the ledger keeps a remaining-seats counter,
/// seeded from the definition's total the first time that date is touched.
///
/// All counter changes go through one atomic primitive. The counter never
/// drops below zero and never rises above the configured total. A slot with
/// no definition is unmanaged and treated as unlimited.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Weekday};
use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EntityKind, FulfillmentError, Result};
use crate::models::{AppointmentRequest, CapacitySlot, SlotKey, TimeSlot};
use crate::store::Table;

/// Result of a ledger adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// No definition governs the slot; nothing is tracked.
    Unmanaged,
    Applied { key: SlotKey, remaining: u32 },
}

pub struct AppointmentCapacityLedger {
    slots: Arc<Table<CapacitySlot>>,
    requests: Arc<Table<AppointmentRequest>>,
    remaining: DashMap<SlotKey, u32>,
    // Serializes slot definition changes so conflict checks see each other.
    definitions: Mutex<()>,
    default_capacity: u32,
}

impl AppointmentCapacityLedger {
    pub fn new(
        slots: Arc<Table<CapacitySlot>>,
        requests: Arc<Table<AppointmentRequest>>,
        default_capacity: u32,
    ) -> Self {
        AppointmentCapacityLedger {
            slots,
            requests,
            remaining: DashMap::new(),
            definitions: Mutex::new(()),
            default_capacity,
        }
    }

    pub fn default_capacity(&self) -> u32 {
        self.default_capacity
    }

    /// Add a slot definition, rejecting overlaps with active ones.
    pub fn define_slot(&self, slot: CapacitySlot) -> Result<CapacitySlot> {
        let _guard = self.definition_lock()?;
        if self.has_conflict(
            slot.location_id,
            slot.time_slot,
            slot.day_of_week,
            (slot.effective_date, slot.expiry_date),
            None,
        ) {
            return Err(FulfillmentError::conflict(
                EntityKind::CapacitySlot,
                slot.id,
                format!(
                    "an active {} definition already covers these days at location {}",
                    slot.time_slot, slot.location_id
                ),
            ));
        }
        self.slots.insert(slot.clone())?;
        info!(
            slot_id = %slot.id,
            location_id = %slot.location_id,
            time_slot = %slot.time_slot,
            day_of_week = ?slot.day_of_week,
            total = slot.total_capacity,
            "capacity slot defined"
        );
        Ok(slot)
    }

    /// Check whether a definition would overlap an active one.
    ///
    /// Two definitions overlap when they share location and time slot, are
    /// both general or both for the same weekday, and their date windows
    /// intersect.
    pub fn has_conflict(
        &self,
        location_id: Uuid,
        time_slot: TimeSlot,
        day_of_week: Option<Weekday>,
        range: (Option<NaiveDate>, Option<NaiveDate>),
        exclude_id: Option<Uuid>,
    ) -> bool {
        let candidate = CapacitySlot {
            id: exclude_id.unwrap_or_else(Uuid::nil),
            location_id,
            time_slot,
            day_of_week,
            effective_date: range.0,
            expiry_date: range.1,
            total_capacity: 0,
            active: true,
        };
        self.slots.count(|existing| {
            existing.active && Some(existing.id) != exclude_id && existing.overlaps_with(&candidate)
        }) > 0
    }

    /// Change a definition's total, shifting already-seeded counters by the
    /// same amount.
    pub fn update_slot_capacity(&self, slot_id: Uuid, total_capacity: u32) -> Result<CapacitySlot> {
        let _guard = self.definition_lock()?;
        let (previous, slot) = self.slots.update(slot_id, |slot| {
            let previous = slot.total_capacity;
            slot.total_capacity = total_capacity;
            Ok((previous, slot.clone()))
        })?;

        let delta = i64::from(total_capacity) - i64::from(previous);
        for mut entry in self.remaining.iter_mut() {
            if entry.key().slot_id == slot_id {
                let shifted = i64::from(*entry.value()) + delta;
                *entry.value_mut() = shifted.clamp(0, i64::from(total_capacity)) as u32;
            }
        }
        info!(%slot_id, previous, total = total_capacity, "capacity slot resized");
        Ok(slot)
    }

    pub fn deactivate_slot(&self, slot_id: Uuid) -> Result<CapacitySlot> {
        let _guard = self.definition_lock()?;
        let slot = self.slots.update(slot_id, |slot| {
            slot.active = false;
            Ok(slot.clone())
        })?;
        info!(%slot_id, "capacity slot deactivated");
        Ok(slot)
    }

    pub fn slots_for(&self, location_id: Uuid) -> Vec<CapacitySlot> {
        let mut slots = self.slots.filter(|s| s.location_id == location_id);
        let weekday = |s: &CapacitySlot| s.day_of_week.map(|d| d.num_days_from_monday());
        slots.sort_by(|a, b| {
            a.time_slot
                .cmp(&b.time_slot)
                .then(weekday(a).cmp(&weekday(b)))
                .then(a.effective_date.cmp(&b.effective_date))
        });
        slots
    }

    /// The definition governing a slot on a date.
    ///
    /// A weekday-specific definition beats a general one; after that the
    /// most recently effective definition wins.
    pub fn resolve(&self, location_id: Uuid, time_slot: TimeSlot, date: NaiveDate) -> Option<CapacitySlot> {
        self.slots
            .filter(|s| s.location_id == location_id && s.time_slot == time_slot && s.applies_on(date))
            .into_iter()
            .max_by(|a, b| {
                a.day_of_week
                    .is_some()
                    .cmp(&b.day_of_week.is_some())
                    .then(a.effective_date.cmp(&b.effective_date))
            })
    }

    /// Apply `delta` to the remaining seats, clamped to `0..=total`.
    pub fn adjust(
        &self,
        location_id: Uuid,
        time_slot: TimeSlot,
        date: NaiveDate,
        delta: i32,
    ) -> AdjustOutcome {
        match self.resolve(location_id, time_slot, date) {
            None => AdjustOutcome::Unmanaged,
            Some(slot) => {
                let key = SlotKey {
                    slot_id: slot.id,
                    date,
                };
                let remaining = self.apply(key, slot.total_capacity, |current| {
                    Ok(clamp_delta(current, delta, slot.total_capacity))
                });
                match remaining {
                    Ok(remaining) => AdjustOutcome::Applied { key, remaining },
                    // The closure above never fails.
                    Err(_) => AdjustOutcome::Unmanaged,
                }
            }
        }
    }

    /// Take one seat. `Ok(None)` means the slot is unmanaged.
    pub fn claim(
        &self,
        location_id: Uuid,
        time_slot: TimeSlot,
        date: NaiveDate,
    ) -> Result<Option<SlotKey>> {
        let Some(slot) = self.resolve(location_id, time_slot, date) else {
            debug!(%location_id, %time_slot, %date, "claim on unmanaged slot");
            return Ok(None);
        };
        let key = SlotKey {
            slot_id: slot.id,
            date,
        };
        let remaining = self.apply(key, slot.total_capacity, |current| {
            if current == 0 {
                return Err(FulfillmentError::conflict(
                    EntityKind::CapacitySlot,
                    slot.id,
                    format!("{} on {} is fully booked", time_slot, date),
                ));
            }
            Ok(current - 1)
        })?;
        debug!(slot_id = %slot.id, %date, remaining, "capacity claimed");
        Ok(Some(key))
    }

    /// Give back one seat on exactly the key that was claimed.
    pub fn release(&self, key: SlotKey) -> Result<u32> {
        let slot = self.slots.require(key.slot_id)?;
        let remaining = self.apply(key, slot.total_capacity, |current| {
            Ok(clamp_delta(current, 1, slot.total_capacity))
        })?;
        debug!(slot_id = %key.slot_id, date = %key.date, remaining, "capacity released");
        Ok(remaining)
    }

    /// Remaining seats on a managed slot, `None` when unmanaged.
    pub fn remaining(&self, location_id: Uuid, time_slot: TimeSlot, date: NaiveDate) -> Option<u32> {
        let slot = self.resolve(location_id, time_slot, date)?;
        let key = SlotKey {
            slot_id: slot.id,
            date,
        };
        Some(
            self.remaining
                .get(&key)
                .map(|r| *r.value())
                .unwrap_or(slot.total_capacity),
        )
    }

    /// Open seats per slot label for a location and day.
    ///
    /// Configured total (or the default when unconfigured) minus every
    /// request bound to the slot that is not rejected, denied, cancelled,
    /// or expired.
    pub fn available_capacity(&self, location_id: Uuid, date: NaiveDate) -> BTreeMap<TimeSlot, u32> {
        TimeSlot::ALL
            .iter()
            .map(|&time_slot| {
                let total = self
                    .resolve(location_id, time_slot, date)
                    .map_or(self.default_capacity, |s| s.total_capacity);
                let booked = self.requests.count(|r| {
                    r.location_id == location_id
                        && r.date == date
                        && r.time_slot == time_slot
                        && r.status.counts_against_capacity()
                });
                (time_slot, total.saturating_sub(booked as u32))
            })
            .collect()
    }

    fn apply(&self, key: SlotKey, total: u32, f: impl FnOnce(u32) -> Result<u32>) -> Result<u32> {
        let mut entry = self.remaining.entry(key).or_insert(total);
        let next = f(*entry.value())?;
        *entry.value_mut() = next;
        Ok(next)
    }

    fn definition_lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.definitions.lock().map_err(|_| {
            FulfillmentError::conflict(
                EntityKind::CapacitySlot,
                "definitions",
                "slot definition lock poisoned",
            )
        })
    }
}

fn clamp_delta(current: u32, delta: i32, total: u32) -> u32 {
    (i64::from(current) + i64::from(delta)).clamp(0, i64::from(total)) as u32
}
