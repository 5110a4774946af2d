/// Inventory allocation.
///
/// Finds the compatible available unit that expires first and reserves it.
/// Every status change is a single atomic row update, so two allocators
/// racing for the same unit cannot both win: the loser sees `Conflict` and
/// should query again for a different candidate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::compatibility::compatible_donor_types;
use crate::error::{EntityKind, FulfillmentError, Result};
use crate::models::{BloodType, ComponentKind, Demand, InventoryStatus, InventoryUnit};
use crate::store::{Page, PageRequest, SortDirection, Table};

/// Enumerated sort keys for unit listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitSort {
    #[default]
    ExpiresAt,
    CreatedAt,
    Quantity,
    BloodType,
}

impl UnitSort {
    fn compare(&self, a: &InventoryUnit, b: &InventoryUnit) -> std::cmp::Ordering {
        match self {
            UnitSort::ExpiresAt => a.expires_at.cmp(&b.expires_at),
            UnitSort::CreatedAt => a.sequence.cmp(&b.sequence),
            UnitSort::Quantity => a.quantity.cmp(&b.quantity),
            UnitSort::BloodType => a.blood_type.cmp(&b.blood_type),
        }
        .then(a.sequence.cmp(&b.sequence))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub status: Option<InventoryStatus>,
    pub blood_type: Option<BloodType>,
    pub component: Option<ComponentKind>,
}

impl UnitFilter {
    fn matches(&self, unit: &InventoryUnit) -> bool {
        self.status.map_or(true, |s| unit.status == s)
            && self.blood_type.map_or(true, |b| unit.blood_type == b)
            && self.component.map_or(true, |c| unit.component == c)
    }
}

/// Available stock for one blood type and component.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockLevel {
    pub units: usize,
    pub quantity: u32,
}

pub struct InventoryAllocator {
    units: Arc<Table<InventoryUnit>>,
    sequence: AtomicU64,
}

impl InventoryAllocator {
    pub fn new(units: Arc<Table<InventoryUnit>>) -> Self {
        InventoryAllocator {
            units,
            sequence: AtomicU64::new(1),
        }
    }

    /// Stock a unit, stamping its creation order.
    pub fn add_unit(&self, mut unit: InventoryUnit) -> Result<InventoryUnit> {
        unit.sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        self.units.insert(unit.clone())?;
        info!(
            unit_id = %unit.id,
            blood_type = %unit.blood_type,
            component = %unit.component,
            quantity = unit.quantity,
            expires_at = %unit.expires_at,
            "inventory unit stocked"
        );
        Ok(unit)
    }

    pub fn get(&self, unit_id: Uuid) -> Result<InventoryUnit> {
        self.units.require(unit_id)
    }

    pub fn find_match(
        &self,
        blood_type: BloodType,
        component: ComponentKind,
        min_quantity: u32,
    ) -> Option<InventoryUnit> {
        self.find_match_at(blood_type, component, min_quantity, Utc::now())
    }

    /// Pick the available compatible unit that expires first.
    ///
    /// Ties on expiry go to the unit stocked first. `None` means nothing in
    /// stock can serve the demand.
    pub fn find_match_at(
        &self,
        blood_type: BloodType,
        component: ComponentKind,
        min_quantity: u32,
        now: DateTime<Utc>,
    ) -> Option<InventoryUnit> {
        let donors = compatible_donor_types(blood_type, component);
        let found = self
            .units
            .filter(|unit| {
                unit.status == InventoryStatus::Available
                    && unit.component == component
                    && donors.contains(&unit.blood_type)
                    && unit.quantity >= min_quantity
                    && unit.expires_at > now
            })
            .into_iter()
            .min_by(|a, b| {
                a.expires_at
                    .cmp(&b.expires_at)
                    .then(a.sequence.cmp(&b.sequence))
            });
        debug!(
            %blood_type,
            %component,
            min_quantity,
            matched = ?found.as_ref().map(|u| u.id),
            "inventory match lookup"
        );
        found
    }

    /// Best unit for a demand. With a deadline, only units still good at the
    /// deadline qualify.
    pub fn find_for_demand(&self, demand: &Demand, now: DateTime<Utc>) -> Option<InventoryUnit> {
        let good_until = demand.deadline.map_or(now, |deadline| deadline.max(now));
        self.find_match_at(demand.blood_type, demand.component, demand.quantity, good_until)
    }

    /// Atomically move a unit from Available to Reserved.
    pub fn reserve(&self, unit_id: Uuid, workflow_id: Uuid) -> Result<InventoryUnit> {
        self.reserve_at(unit_id, workflow_id, Utc::now())
    }

    pub(crate) fn reserve_at(
        &self,
        unit_id: Uuid,
        workflow_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<InventoryUnit> {
        let unit = self.units.update(unit_id, |unit| {
            if unit.status != InventoryStatus::Available {
                return Err(FulfillmentError::conflict(
                    EntityKind::InventoryUnit,
                    unit_id,
                    format!("unit is already {}", unit.status),
                ));
            }
            if unit.is_expired_at(now) {
                return Err(FulfillmentError::validation(format!(
                    "unit {} expired at {}",
                    unit_id, unit.expires_at
                )));
            }
            unit.status = InventoryStatus::Reserved;
            unit.reserved_for = Some(workflow_id);
            Ok(unit.clone())
        })?;
        info!(%unit_id, %workflow_id, "inventory unit reserved");
        Ok(unit)
    }

    /// Return a reserved unit to stock. Releasing an available unit is a no-op.
    pub fn release(&self, unit_id: Uuid) -> Result<InventoryUnit> {
        let unit = self.units.update(unit_id, |unit| {
            match unit.status {
                InventoryStatus::Available => {}
                InventoryStatus::Reserved => {
                    unit.status = InventoryStatus::Available;
                    unit.reserved_for = None;
                }
                status => {
                    return Err(FulfillmentError::invalid_state(
                        EntityKind::InventoryUnit,
                        unit_id,
                        "release",
                        status,
                    ))
                }
            }
            Ok(unit.clone())
        })?;
        info!(%unit_id, "inventory unit released");
        Ok(unit)
    }

    /// Mark a reserved unit as used. Permanent.
    pub fn consume(&self, unit_id: Uuid) -> Result<InventoryUnit> {
        let unit = self.units.update(unit_id, |unit| {
            transition(unit, InventoryStatus::Used, "consume")?;
            Ok(unit.clone())
        })?;
        info!(%unit_id, "inventory unit consumed");
        Ok(unit)
    }

    /// Take an available unit out of stock, e.g. after a failed quality check.
    pub fn discard(&self, unit_id: Uuid, reason: &str) -> Result<InventoryUnit> {
        let unit = self.units.update(unit_id, |unit| {
            transition(unit, InventoryStatus::Discarded, "discard")?;
            Ok(unit.clone())
        })?;
        info!(%unit_id, reason, "inventory unit discarded");
        Ok(unit)
    }

    /// Expire every available or reserved unit past its expiration.
    ///
    /// Returns the ids that changed. Units that moved on concurrently are
    /// skipped.
    pub fn expire_units(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let candidates = self.units.filter(|unit| {
            matches!(
                unit.status,
                InventoryStatus::Available | InventoryStatus::Reserved
            ) && unit.is_expired_at(now)
        });

        let mut expired = Vec::new();
        for candidate in candidates {
            let result = self.units.update(candidate.id, |unit| {
                if !unit.is_expired_at(now) {
                    return Ok(false);
                }
                transition(unit, InventoryStatus::Expired, "expire")?;
                Ok(true)
            });
            match result {
                Ok(true) => expired.push(candidate.id),
                Ok(false) => {}
                Err(e) => debug!(unit_id = %candidate.id, error = %e, "skipped expiring unit"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "inventory units expired");
        }
        expired
    }

    /// Available, unexpired stock grouped by blood type and component.
    pub fn stock_levels(&self, now: DateTime<Utc>) -> BTreeMap<(BloodType, ComponentKind), StockLevel> {
        let mut levels: BTreeMap<(BloodType, ComponentKind), StockLevel> = BTreeMap::new();
        for unit in self
            .units
            .filter(|u| u.status == InventoryStatus::Available && !u.is_expired_at(now))
        {
            let level = levels.entry((unit.blood_type, unit.component)).or_default();
            level.units += 1;
            level.quantity += unit.quantity;
        }
        levels
    }

    pub fn list(
        &self,
        filter: &UnitFilter,
        sort: UnitSort,
        direction: SortDirection,
        page: PageRequest,
    ) -> Page<InventoryUnit> {
        self.units.page(
            |unit| filter.matches(unit),
            |a, b| direction.apply(sort.compare(a, b)),
            page,
        )
    }
}

fn transition(unit: &mut InventoryUnit, next: InventoryStatus, action: &'static str) -> Result<()> {
    if !unit.status.can_transition_to(next) {
        return Err(FulfillmentError::invalid_state(
            EntityKind::InventoryUnit,
            unit.id,
            action,
            unit.status,
        ));
    }
    unit.status = next;
    if next != InventoryStatus::Reserved {
        unit.reserved_for = None;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn allocator() -> InventoryAllocator {
        InventoryAllocator::new(Arc::new(Table::default()))
    }

    fn stock(
        allocator: &InventoryAllocator,
        blood_type: BloodType,
        component: ComponentKind,
        quantity: u32,
        expires_in_days: i64,
    ) -> InventoryUnit {
        let unit = InventoryUnit::new(
            blood_type,
            component,
            quantity,
            Utc::now() + Duration::days(expires_in_days),
        )
        .unwrap();
        allocator.add_unit(unit).unwrap()
    }

    #[test]
    fn earliest_expiry_wins_among_compatible_units() {
        let allocator = allocator();
        let later = stock(&allocator, BloodType::OPos, ComponentKind::RedCells, 2, 5);
        let sooner = stock(&allocator, BloodType::ONeg, ComponentKind::RedCells, 2, 3);

        let found = allocator
            .find_match(BloodType::OPos, ComponentKind::RedCells, 2)
            .unwrap();
        assert_eq!(found.id, sooner.id);
        assert_ne!(found.id, later.id);
    }

    #[test]
    fn expiry_ties_go_to_the_older_unit() {
        let allocator = allocator();
        let expires = Utc::now() + Duration::days(4);
        let first = allocator
            .add_unit(InventoryUnit::new(BloodType::APos, ComponentKind::Plasma, 1, expires).unwrap())
            .unwrap();
        let _second = allocator
            .add_unit(InventoryUnit::new(BloodType::APos, ComponentKind::Plasma, 1, expires).unwrap())
            .unwrap();

        let found = allocator
            .find_match(BloodType::APos, ComponentKind::Plasma, 1)
            .unwrap();
        assert_eq!(found.id, first.id);
    }

    #[test]
    fn incompatible_short_or_expired_units_are_skipped() {
        let allocator = allocator();
        stock(&allocator, BloodType::APos, ComponentKind::RedCells, 5, 10);
        stock(&allocator, BloodType::OPos, ComponentKind::RedCells, 1, 10);
        stock(&allocator, BloodType::OPos, ComponentKind::Plasma, 5, 10);
        stock(&allocator, BloodType::OPos, ComponentKind::RedCells, 5, -1);

        assert!(allocator
            .find_match(BloodType::OPos, ComponentKind::RedCells, 2)
            .is_none());
    }

    #[test]
    fn reserve_is_exclusive() {
        let allocator = allocator();
        let unit = stock(&allocator, BloodType::BPos, ComponentKind::RedCells, 1, 10);

        allocator.reserve(unit.id, Uuid::new_v4()).unwrap();
        let err = allocator.reserve(unit.id, Uuid::new_v4()).unwrap_err();
        assert!(err.is_conflict());
        assert!(allocator
            .find_match(BloodType::BPos, ComponentKind::RedCells, 1)
            .is_none());
    }

    #[test]
    fn release_is_safe_to_repeat() {
        let allocator = allocator();
        let unit = stock(&allocator, BloodType::BPos, ComponentKind::RedCells, 1, 10);
        allocator.reserve(unit.id, Uuid::new_v4()).unwrap();

        let released = allocator.release(unit.id).unwrap();
        assert_eq!(released.status, InventoryStatus::Available);
        assert_eq!(released.reserved_for, None);
        let again = allocator.release(unit.id).unwrap();
        assert_eq!(again.status, InventoryStatus::Available);
    }

    #[test]
    fn consume_requires_reservation_and_is_permanent() {
        let allocator = allocator();
        let unit = stock(&allocator, BloodType::AbNeg, ComponentKind::Platelets, 1, 2);

        let err = allocator.consume(unit.id).unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidState { .. }));

        allocator.reserve(unit.id, Uuid::new_v4()).unwrap();
        let used = allocator.consume(unit.id).unwrap();
        assert_eq!(used.status, InventoryStatus::Used);
        assert!(allocator.release(unit.id).is_err());
    }

    #[test]
    fn discard_takes_available_stock_out_of_matching() {
        let allocator = allocator();
        let unit = stock(&allocator, BloodType::ONeg, ComponentKind::Plasma, 1, 30);

        let discarded = allocator.discard(unit.id, "failed quality check").unwrap();
        assert_eq!(discarded.status, InventoryStatus::Discarded);
        assert!(allocator
            .find_match(BloodType::ONeg, ComponentKind::Plasma, 1)
            .is_none());
        assert!(matches!(
            allocator.reserve(unit.id, Uuid::new_v4()),
            Err(FulfillmentError::Conflict { .. })
        ));
        assert!(matches!(
            allocator.discard(unit.id, "again"),
            Err(FulfillmentError::InvalidState { .. })
        ));
    }

    #[test]
    fn reserved_units_cannot_be_discarded() {
        let allocator = allocator();
        let unit = stock(&allocator, BloodType::ONeg, ComponentKind::Plasma, 1, 30);
        allocator.reserve(unit.id, Uuid::new_v4()).unwrap();

        let err = allocator.discard(unit.id, "broken seal").unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidState { .. }));
        assert_eq!(allocator.get(unit.id).unwrap().status, InventoryStatus::Reserved);
    }

    #[test]
    fn demand_deadline_skips_units_expiring_first() {
        let allocator = allocator();
        let short = stock(&allocator, BloodType::ONeg, ComponentKind::RedCells, 2, 2);
        let long = stock(&allocator, BloodType::ONeg, ComponentKind::RedCells, 2, 8);
        let demand = Demand::new(
            crate::models::RequestKind::Standard,
            BloodType::APos,
            ComponentKind::RedCells,
            2,
            crate::models::Priority::Routine,
            "Ward 2",
        )
        .unwrap();

        let now = Utc::now();
        assert_eq!(allocator.find_for_demand(&demand, now).unwrap().id, short.id);
        let due_in_five = demand.with_deadline(now + Duration::days(5));
        assert_eq!(allocator.find_for_demand(&due_in_five, now).unwrap().id, long.id);
        let due_in_ten = due_in_five.with_deadline(now + Duration::days(10));
        assert!(allocator.find_for_demand(&due_in_ten, now).is_none());
    }

    #[test]
    fn expire_sweep_only_touches_past_units() {
        let allocator = allocator();
        let stale = stock(&allocator, BloodType::ONeg, ComponentKind::Platelets, 1, -2);
        let stale_reserved = stock(&allocator, BloodType::ONeg, ComponentKind::Platelets, 1, 1);
        let fresh = stock(&allocator, BloodType::ONeg, ComponentKind::Platelets, 1, 9);
        allocator.reserve(stale_reserved.id, Uuid::new_v4()).unwrap();

        let expired = allocator.expire_units(Utc::now() + Duration::days(2));
        assert_eq!(expired.len(), 2);
        assert!(expired.contains(&stale.id));
        assert!(expired.contains(&stale_reserved.id));
        assert_eq!(allocator.get(fresh.id).unwrap().status, InventoryStatus::Available);
    }

    #[test]
    fn stock_levels_sum_available_quantity() {
        let allocator = allocator();
        stock(&allocator, BloodType::APos, ComponentKind::RedCells, 2, 10);
        stock(&allocator, BloodType::APos, ComponentKind::RedCells, 3, 10);
        let reserved = stock(&allocator, BloodType::APos, ComponentKind::RedCells, 4, 10);
        allocator.reserve(reserved.id, Uuid::new_v4()).unwrap();

        let levels = allocator.stock_levels(Utc::now());
        let level = levels[&(BloodType::APos, ComponentKind::RedCells)];
        assert_eq!(level, StockLevel { units: 2, quantity: 5 });
    }

    #[test]
    fn list_pages_by_expiry() {
        let allocator = allocator();
        for days in [9, 3, 6] {
            stock(&allocator, BloodType::OPos, ComponentKind::Plasma, 1, days);
        }
        let page = allocator.list(
            &UnitFilter {
                component: Some(ComponentKind::Plasma),
                ..UnitFilter::default()
            },
            UnitSort::ExpiresAt,
            SortDirection::Descending,
            PageRequest::first(2),
        );
        assert_eq!(page.total, 3);
        assert!(page.items[0].expires_at > page.items[1].expires_at);
    }
}
