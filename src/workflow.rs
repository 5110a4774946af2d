/// Donation workflow state machine.
///
/// A workflow is one attempt to fulfill one demand. It ends either from
/// stock (`CompletedFromInventory`), from a donor's donation (`Completed`),
/// or in `Cancelled`:
///
/// ```text
/// Created ──┬─> DonorAssigned ──> Scheduled ──> Completed
///           ├─> Scheduled                   └─> CompletedFromInventory
///           └─> CompletedFromInventory
/// any non-terminal state ──> Cancelled
/// ```
///
/// Every transition is one atomic row update. Side effects on other
/// entities (unit reservation, demand fulfillment) run inside that update
/// and are undone if a later step fails, so callers never observe a
/// half-applied transition. Nothing is retried automatically.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::compatibility::is_compatible;
use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::error::{EntityKind, FulfillmentError, Result};
use crate::inventory::InventoryAllocator;
use crate::models::{
    AppointmentLink, BloodType, Demand, DemandRef, DemandStatus, DonationRecord, DonationWorkflow,
    Donor, InventoryStatus, InventoryUnit, WorkflowStatus,
};
use crate::notify::{dispatch, NotificationKind, Notifier};
use crate::store::{Page, PageRequest, SortDirection, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub auto_match_on_create: bool,
    /// Days from a donation to the donor's next eligible date.
    pub donation_interval_days: i64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        WorkflowSettings {
            auto_match_on_create: true,
            donation_interval_days: 90,
        }
    }
}

impl From<&EngineConfig> for WorkflowSettings {
    fn from(config: &EngineConfig) -> Self {
        WorkflowSettings {
            auto_match_on_create: config.inventory.auto_match_on_create,
            donation_interval_days: config.eligibility.min_donation_interval_days,
        }
    }
}

/// Enumerated sort keys for workflow listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowSort {
    #[default]
    CreatedAt,
    UpdatedAt,
    CompletedAt,
    BloodType,
}

impl WorkflowSort {
    fn compare(&self, a: &DonationWorkflow, b: &DonationWorkflow) -> std::cmp::Ordering {
        match self {
            WorkflowSort::CreatedAt => a.created_at.cmp(&b.created_at),
            WorkflowSort::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            WorkflowSort::CompletedAt => a.completed_at.cmp(&b.completed_at),
            WorkflowSort::BloodType => a.blood_type.cmp(&b.blood_type),
        }
        .then(a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub donor_id: Option<Uuid>,
    pub demand_id: Option<Uuid>,
    pub active_only: bool,
}

impl WorkflowFilter {
    fn matches(&self, wf: &DonationWorkflow) -> bool {
        self.status.map_or(true, |s| wf.status == s)
            && self.donor_id.map_or(true, |d| wf.donor_id == Some(d))
            && self.demand_id.map_or(true, |d| wf.demand.id == d)
            && (!self.active_only || wf.is_active)
    }
}

pub struct WorkflowEngine {
    workflows: Arc<Table<DonationWorkflow>>,
    demands: Arc<Table<Demand>>,
    allocator: Arc<InventoryAllocator>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
    settings: WorkflowSettings,
}

impl WorkflowEngine {
    pub fn new(
        workflows: Arc<Table<DonationWorkflow>>,
        demands: Arc<Table<Demand>>,
        allocator: Arc<InventoryAllocator>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        settings: WorkflowSettings,
    ) -> Self {
        WorkflowEngine {
            workflows,
            demands,
            allocator,
            directory,
            notifier,
            settings,
        }
    }

    /// Register a new demand.
    pub fn submit_demand(&self, demand: Demand) -> Result<Demand> {
        self.demands.insert(demand.clone())?;
        info!(
            demand_id = %demand.id,
            kind = %demand.kind,
            blood_type = %demand.blood_type,
            component = %demand.component,
            quantity = demand.quantity,
            priority = demand.priority.name(),
            "demand submitted"
        );
        Ok(demand)
    }

    pub fn demand(&self, demand_id: Uuid) -> Result<Demand> {
        self.demands.require(demand_id)
    }

    pub fn cancel_demand(&self, demand_id: Uuid) -> Result<Demand> {
        let demand = self.demands.update(demand_id, |demand| {
            if demand.status != DemandStatus::Open {
                return Err(FulfillmentError::invalid_state(
                    EntityKind::Demand,
                    demand_id,
                    "cancel",
                    demand.status,
                ));
            }
            demand.status = DemandStatus::Cancelled;
            Ok(demand.clone())
        })?;
        info!(%demand_id, "demand cancelled");
        Ok(demand)
    }

    /// Open demands, most urgent first, then oldest.
    pub fn open_demands(&self) -> Vec<Demand> {
        let mut open = self.demands.filter(|d| d.status == DemandStatus::Open);
        open.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        open
    }

    /// Start a workflow for a demand.
    ///
    /// When auto-matching is on and stock can serve the demand, the best unit
    /// is reserved and the workflow completes immediately. A lost race for
    /// that unit surfaces as `Conflict` and nothing is stored; the caller
    /// re-issues the request.
    pub fn create(&self, demand_ref: DemandRef) -> Result<DonationWorkflow> {
        self.create_with(demand_ref, self.settings.auto_match_on_create)
    }

    pub fn create_with(&self, demand_ref: DemandRef, auto_match: bool) -> Result<DonationWorkflow> {
        let demand = self.demands.require(demand_ref.id)?;
        if demand.kind != demand_ref.kind {
            return Err(FulfillmentError::validation(format!(
                "demand {} is a {} request, not {}",
                demand.id, demand.kind, demand_ref.kind
            )));
        }
        if demand.status != DemandStatus::Open {
            return Err(FulfillmentError::invalid_state(
                EntityKind::Demand,
                demand.id,
                "start a workflow for",
                demand.status,
            ));
        }

        let mut workflow = DonationWorkflow::for_demand(&demand);
        let matched = if auto_match {
            self.allocator.find_for_demand(&demand, Utc::now())
        } else {
            None
        };

        let mut undo = None;
        if let Some(unit) = matched {
            self.allocator.reserve(unit.id, workflow.id)?;
            match self.fulfill_demand(demand.id, true) {
                Ok(token) => undo = token.map(|token| (unit.id, token)),
                Err(e) => {
                    self.undo_reservation(unit.id);
                    return Err(e);
                }
            }
            let now = Utc::now();
            workflow.status = WorkflowStatus::CompletedFromInventory;
            workflow.reserved_unit_id = Some(unit.id);
            workflow.completed_at = Some(now);
            workflow.updated_at = now;
            workflow.note = Some(format!(
                "fulfilled from inventory unit {} ({})",
                unit.id, unit.blood_type
            ));
        }

        if let Err(e) = self.workflows.insert(workflow.clone()) {
            if let Some((unit_id, token)) = undo {
                self.reopen_demand(token);
                self.undo_reservation(unit_id);
            }
            return Err(e);
        }
        info!(
            workflow_id = %workflow.id,
            demand_id = %demand.id,
            status = %workflow.status,
            reserved_unit = ?workflow.reserved_unit_id,
            "workflow created"
        );
        Ok(workflow)
    }

    pub fn get(&self, workflow_id: Uuid) -> Result<DonationWorkflow> {
        self.workflows.require(workflow_id)
    }

    pub fn list(
        &self,
        filter: &WorkflowFilter,
        sort: WorkflowSort,
        direction: SortDirection,
        page: PageRequest,
    ) -> Page<DonationWorkflow> {
        self.workflows.page(
            |wf| filter.matches(wf),
            |a, b| direction.apply(sort.compare(a, b)),
            page,
        )
    }

    /// Assign a donor, optionally with an appointment date and location.
    ///
    /// Goes to `DonorAssigned`, or straight to `Scheduled` when an
    /// appointment is supplied.
    pub fn assign_donor(
        &self,
        workflow_id: Uuid,
        donor_id: Uuid,
        appointment: Option<(NaiveDate, Uuid)>,
    ) -> Result<DonationWorkflow> {
        let donor = self.directory.donor(donor_id)?;
        if let Some((date, location_id)) = appointment {
            self.directory.location(location_id)?;
            if date < Utc::now().date_naive() {
                return Err(FulfillmentError::validation(format!(
                    "appointment date {date} is in the past"
                )));
            }
        }

        let workflow = self.workflows.update(workflow_id, |wf| {
            if wf.status != WorkflowStatus::Created {
                return Err(FulfillmentError::invalid_state(
                    EntityKind::Workflow,
                    wf.id,
                    "assign a donor to",
                    wf.status,
                ));
            }
            ensure_donor_matches(wf, donor.blood_type)?;
            wf.donor_id = Some(donor_id);
            match appointment {
                Some((date, location_id)) => {
                    wf.appointment = Some(AppointmentLink {
                        request_id: None,
                        date,
                        location_id,
                        confirmed: false,
                    });
                    wf.transition(WorkflowStatus::Scheduled, "schedule")?;
                }
                None => wf.transition(WorkflowStatus::DonorAssigned, "assign a donor to")?,
            }
            wf.note = Some(format!("donor {} assigned", donor.name));
            Ok(wf.clone())
        })?;

        info!(%workflow_id, %donor_id, status = %workflow.status, "donor assigned");
        dispatch(
            self.notifier.as_ref(),
            donor_id,
            NotificationKind::DonorAssigned,
            &format!(
                "You have been matched to a {} {} request",
                workflow.blood_type, workflow.component
            ),
        );
        Ok(workflow)
    }

    /// Attach appointment details to a workflow with an assigned donor.
    ///
    /// `DonorAssigned` moves to `Scheduled`; a `Scheduled` workflow is
    /// rescheduled and loses its confirmation.
    pub fn schedule_appointment(
        &self,
        workflow_id: Uuid,
        request_id: Option<Uuid>,
        date: NaiveDate,
        location_id: Uuid,
    ) -> Result<DonationWorkflow> {
        self.directory.location(location_id)?;
        let workflow = self.workflows.update(workflow_id, |wf| {
            match wf.status {
                WorkflowStatus::DonorAssigned => {
                    wf.transition(WorkflowStatus::Scheduled, "schedule")?
                }
                WorkflowStatus::Scheduled => wf.updated_at = Utc::now(),
                status => {
                    return Err(FulfillmentError::invalid_state(
                        EntityKind::Workflow,
                        wf.id,
                        "schedule",
                        status,
                    ))
                }
            }
            wf.appointment = Some(AppointmentLink {
                request_id,
                date,
                location_id,
                confirmed: false,
            });
            wf.note = Some(format!("appointment on {date}"));
            Ok(wf.clone())
        })?;
        info!(%workflow_id, ?request_id, %date, %location_id, "workflow scheduled");
        if let Some(donor_id) = workflow.donor_id {
            dispatch(
                self.notifier.as_ref(),
                donor_id,
                NotificationKind::WorkflowStatusChanged,
                &format!("Your donation is scheduled for {date}"),
            );
        }
        Ok(workflow)
    }

    /// Fulfill a workflow from a specific unit in stock.
    pub fn fulfill_from_inventory(&self, workflow_id: Uuid, unit_id: Uuid) -> Result<DonationWorkflow> {
        let unit = self.allocator.get(unit_id)?;
        let current = self.workflows.require(workflow_id)?;
        let demand = self.demands.require(current.demand.id)?;
        if let Some(deadline) = demand.deadline {
            if unit.expires_at < deadline {
                return Err(FulfillmentError::validation(format!(
                    "unit {} expires at {}, before the demand deadline {}",
                    unit.id, unit.expires_at, deadline
                )));
            }
        }
        let now = Utc::now();

        let workflow = self.workflows.update(workflow_id, |wf| {
            check_unit_serves(wf, &unit, now)?;
            let had_donor = wf.donor_id.is_some();
            wf.transition(WorkflowStatus::CompletedFromInventory, "fulfill from inventory")?;

            self.allocator.reserve_at(unit_id, wf.id, now)?;
            if let Err(e) = self.fulfill_demand(wf.demand.id, false) {
                self.undo_reservation(unit_id);
                return Err(e);
            }

            wf.reserved_unit_id = Some(unit_id);
            wf.completed_at = Some(now);
            wf.note = Some(if had_donor {
                format!("fulfilled from inventory unit {unit_id}; donor assignment no longer needed")
            } else {
                format!("fulfilled from inventory unit {unit_id}")
            });
            Ok(wf.clone())
        })?;

        info!(%workflow_id, %unit_id, "workflow fulfilled from inventory");
        if let Some(donor_id) = workflow.donor_id {
            dispatch(
                self.notifier.as_ref(),
                donor_id,
                NotificationKind::WorkflowStatusChanged,
                "The request you were matched to was fulfilled from stock",
            );
        }
        Ok(workflow)
    }

    /// Record a completed donation.
    ///
    /// Creates a new available unit of `quantity` expiring after the
    /// component's shelf life, fulfills the demand, and moves the donor's
    /// next eligible date forward by the donation interval.
    ///
    /// The side effects run inside the workflow update in the order demand,
    /// donor, unit. A failing step undoes the ones before it and the workflow
    /// keeps its status, so the call can be retried.
    pub fn complete_donation(
        &self,
        workflow_id: Uuid,
        donation_date: NaiveDate,
        location_id: Uuid,
        quantity: u32,
    ) -> Result<(DonationWorkflow, InventoryUnit)> {
        if quantity == 0 {
            return Err(FulfillmentError::validation("donated quantity must be positive"));
        }
        self.directory.location(location_id)?;
        let current = self.workflows.require(workflow_id)?;
        let donor_id = current.donor_id.ok_or_else(|| {
            FulfillmentError::invalid_state(
                EntityKind::Workflow,
                workflow_id,
                "complete a donation for",
                format!("{} without a donor", current.status),
            )
        })?;
        let donor = self.directory.donor(donor_id)?;
        let next_eligible = Duration::try_days(self.settings.donation_interval_days)
            .and_then(|interval| donation_date.checked_add_signed(interval))
            .ok_or_else(|| {
                FulfillmentError::validation(format!(
                    "next eligible date after {donation_date} is out of range"
                ))
            })?;

        let mut unit = InventoryUnit::new(
            donor.blood_type,
            current.component,
            quantity,
            current.component.expiration_for(donation_date)?,
        )?;
        unit.source_workflow = Some(workflow_id);

        let (workflow, unit) = self.workflows.update(workflow_id, |wf| {
            if wf.donor_id != Some(donor_id) {
                return Err(FulfillmentError::conflict(
                    EntityKind::Workflow,
                    wf.id,
                    "donor changed while completing the donation",
                ));
            }
            wf.transition(WorkflowStatus::Completed, "complete a donation for")?;

            let demand_undo = self.fulfill_demand(wf.demand.id, false)?;
            if let Err(e) = self
                .directory
                .record_donation(donor_id, donation_date, next_eligible)
            {
                if let Some(token) = demand_undo {
                    self.reopen_demand(token);
                }
                return Err(e);
            }
            let unit = match self.allocator.add_unit(unit) {
                Ok(unit) => unit,
                Err(e) => {
                    self.restore_donor(&donor);
                    if let Some(token) = demand_undo {
                        self.reopen_demand(token);
                    }
                    return Err(e);
                }
            };

            wf.donation = Some(DonationRecord {
                date: donation_date,
                location_id,
                quantity,
                unit_id: unit.id,
            });
            wf.completed_at = Some(Utc::now());
            wf.note = Some(format!("donation of {quantity} unit(s) completed"));
            Ok((wf.clone(), unit))
        })?;

        info!(
            %workflow_id,
            %donor_id,
            unit_id = %unit.id,
            %donation_date,
            %next_eligible,
            "donation completed"
        );
        dispatch(
            self.notifier.as_ref(),
            donor_id,
            NotificationKind::DemandFulfilled,
            &format!("Thank you! You can donate again from {next_eligible}"),
        );
        Ok((workflow, unit))
    }

    /// Mark the workflow's appointment as confirmed. No status change.
    pub fn confirm_appointment(&self, workflow_id: Uuid) -> Result<DonationWorkflow> {
        let workflow = self.workflows.update(workflow_id, |wf| {
            if wf.status != WorkflowStatus::Scheduled {
                return Err(FulfillmentError::invalid_state(
                    EntityKind::Workflow,
                    wf.id,
                    "confirm the appointment of",
                    wf.status,
                ));
            }
            let appointment = wf.appointment.as_mut().ok_or_else(|| {
                FulfillmentError::validation(format!("workflow {} has no appointment date", wf.id))
            })?;
            appointment.confirmed = true;
            wf.updated_at = Utc::now();
            Ok(wf.clone())
        })?;
        info!(%workflow_id, "appointment confirmed");
        Ok(workflow)
    }

    /// Cancel a workflow that has not finished.
    ///
    /// Releases any unit it reserved. Linked appointment requests are left
    /// alone; cancelling those is a separate caller decision.
    pub fn cancel(&self, workflow_id: Uuid, reason: &str) -> Result<DonationWorkflow> {
        let workflow = self.workflows.update(workflow_id, |wf| {
            wf.transition(WorkflowStatus::Cancelled, "cancel")?;
            if let Some(unit_id) = wf.reserved_unit_id.take() {
                self.allocator.release(unit_id)?;
            }
            wf.note = Some(reason.to_string());
            wf.is_active = false;
            Ok(wf.clone())
        })?;
        info!(%workflow_id, reason, "workflow cancelled");
        if let Some(donor_id) = workflow.donor_id {
            dispatch(
                self.notifier.as_ref(),
                donor_id,
                NotificationKind::WorkflowStatusChanged,
                &format!("The donation you were scheduled for was cancelled: {reason}"),
            );
        }
        Ok(workflow)
    }

    /// Open → Fulfilled, written optimistically against the demand's version.
    ///
    /// Returns an undo token when this call made the change. With
    /// `require_open` a demand that already left `Open` is `InvalidState`;
    /// otherwise it is left as is.
    fn fulfill_demand(&self, demand_id: Uuid, require_open: bool) -> Result<Option<DemandUndo>> {
        let current = self
            .demands
            .get_versioned(demand_id)
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Demand, demand_id))?;
        if current.value.status != DemandStatus::Open {
            if require_open {
                return Err(FulfillmentError::invalid_state(
                    EntityKind::Demand,
                    demand_id,
                    "fulfill",
                    current.value.status,
                ));
            }
            return Ok(None);
        }

        let mut fulfilled = current.value.clone();
        fulfilled.status = DemandStatus::Fulfilled;
        fulfilled.fulfilled_at = Some(Utc::now());
        let version = self
            .demands
            .compare_and_swap(demand_id, current.version, fulfilled)?;
        Ok(Some(DemandUndo {
            previous: current.value,
            version,
        }))
    }

    /// Put a demand back to what it was, unless someone wrote it since.
    fn reopen_demand(&self, undo: DemandUndo) {
        let demand_id = undo.previous.id;
        if let Err(e) = self
            .demands
            .compare_and_swap(demand_id, undo.version, undo.previous)
        {
            warn!(%demand_id, error = %e, "failed to reopen demand after aborted fulfillment");
        }
    }

    fn restore_donor(&self, donor: &Donor) {
        if let Err(e) =
            self.directory
                .restore_eligibility(donor.id, donor.last_donation, donor.next_eligible)
        {
            warn!(donor_id = %donor.id, error = %e, "failed to restore donor eligibility");
        }
    }

    fn undo_reservation(&self, unit_id: Uuid) {
        if let Err(e) = self.allocator.release(unit_id) {
            warn!(%unit_id, error = %e, "failed to release reservation after aborted fulfillment");
        }
    }
}

#[derive(Debug)]
struct DemandUndo {
    previous: Demand,
    version: u64,
}

fn ensure_donor_matches(wf: &DonationWorkflow, donor_type: BloodType) -> Result<()> {
    if !is_compatible(donor_type, wf.blood_type, wf.component) {
        return Err(FulfillmentError::validation(format!(
            "{donor_type} donor cannot supply {} {} for workflow {}",
            wf.blood_type, wf.component, wf.id
        )));
    }
    Ok(())
}

fn check_unit_serves(
    wf: &DonationWorkflow,
    unit: &InventoryUnit,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    if wf.status.is_terminal() {
        return Err(FulfillmentError::invalid_state(
            EntityKind::Workflow,
            wf.id,
            "fulfill from inventory",
            wf.status,
        ));
    }
    if unit.component != wf.component {
        return Err(FulfillmentError::validation(format!(
            "unit {} is {}, workflow needs {}",
            unit.id, unit.component, wf.component
        )));
    }
    if !is_compatible(unit.blood_type, wf.blood_type, wf.component) {
        return Err(FulfillmentError::validation(format!(
            "unit {} is {}, incompatible with {} recipient",
            unit.id, unit.blood_type, wf.blood_type
        )));
    }
    if unit.quantity < wf.quantity {
        return Err(FulfillmentError::validation(format!(
            "unit {} holds {}, workflow needs {}",
            unit.id, unit.quantity, wf.quantity
        )));
    }
    if unit.is_expired_at(now) {
        return Err(FulfillmentError::validation(format!(
            "unit {} expired at {}",
            unit.id, unit.expires_at
        )));
    }
    if unit.status != InventoryStatus::Available {
        return Err(FulfillmentError::conflict(
            EntityKind::InventoryUnit,
            unit.id,
            format!("unit is already {}", unit.status),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::models::{ComponentKind, Donor, Location, Priority, RequestKind};
    use crate::notify::RecordingNotifier;
    use tracing_test::traced_test;

    struct Fixture {
        engine: WorkflowEngine,
        allocator: Arc<InventoryAllocator>,
        directory: Arc<InMemoryDirectory>,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture_with(notifier: RecordingNotifier, settings: WorkflowSettings) -> Fixture {
        let allocator = Arc::new(InventoryAllocator::new(Arc::new(Table::default())));
        let directory = Arc::new(InMemoryDirectory::new());
        let notifier = Arc::new(notifier);
        let engine = WorkflowEngine::new(
            Arc::new(Table::default()),
            Arc::new(Table::default()),
            allocator.clone(),
            directory.clone(),
            notifier.clone(),
            settings,
        );
        Fixture {
            engine,
            allocator,
            directory,
            notifier,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingNotifier::new(), WorkflowSettings::default())
    }

    fn demand(f: &Fixture, blood_type: BloodType, quantity: u32) -> Demand {
        f.engine
            .submit_demand(
                Demand::new(
                    RequestKind::Standard,
                    blood_type,
                    ComponentKind::RedCells,
                    quantity,
                    Priority::Routine,
                    "Ward 7",
                )
                .unwrap(),
            )
            .unwrap()
    }

    fn stock(f: &Fixture, blood_type: BloodType, quantity: u32, days: i64) -> InventoryUnit {
        f.allocator
            .add_unit(
                InventoryUnit::new(
                    blood_type,
                    ComponentKind::RedCells,
                    quantity,
                    Utc::now() + Duration::days(days),
                )
                .unwrap(),
            )
            .unwrap()
    }

    fn donor(f: &Fixture, blood_type: BloodType) -> Uuid {
        f.directory.add_donor(Donor::new("Linus", blood_type).unwrap())
    }

    fn location(f: &Fixture) -> Uuid {
        f.directory.add_location(Location::new("Central").unwrap())
    }

    #[test]
    fn create_fulfills_from_stock_when_possible() {
        let f = fixture();
        let unit = stock(&f, BloodType::ONeg, 2, 10);
        let demand = demand(&f, BloodType::APos, 2);

        let wf = f.engine.create(demand.reference()).unwrap();
        assert_eq!(wf.status, WorkflowStatus::CompletedFromInventory);
        assert_eq!(wf.reserved_unit_id, Some(unit.id));
        assert!(wf.completed_at.is_some());
        assert_eq!(f.engine.demand(demand.id).unwrap().status, DemandStatus::Fulfilled);
        assert_eq!(f.allocator.get(unit.id).unwrap().status, InventoryStatus::Reserved);
    }

    #[test]
    fn create_without_stock_waits_for_a_donor() {
        let f = fixture();
        let demand = demand(&f, BloodType::APos, 2);
        let wf = f.engine.create(demand.reference()).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Created);
        assert_eq!(f.engine.demand(demand.id).unwrap().status, DemandStatus::Open);
    }

    #[test]
    fn create_validates_the_source_demand() {
        let f = fixture();
        let err = f
            .engine
            .create(DemandRef {
                id: Uuid::new_v4(),
                kind: RequestKind::Standard,
            })
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound { entity: EntityKind::Demand, .. }));

        let demand = demand(&f, BloodType::APos, 1);
        let err = f
            .engine
            .create(DemandRef {
                id: demand.id,
                kind: RequestKind::Emergency,
            })
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(_)));
    }

    #[test]
    fn assign_donor_with_appointment_goes_straight_to_scheduled() {
        let f = fixture();
        let demand = demand(&f, BloodType::APos, 1);
        let wf = f.engine.create(demand.reference()).unwrap();
        let donor = donor(&f, BloodType::APos);
        let site = location(&f);
        let date = Utc::now().date_naive() + Duration::days(3);

        let wf = f.engine.assign_donor(wf.id, donor, Some((date, site))).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Scheduled);
        assert_eq!(wf.appointment.as_ref().unwrap().date, date);
        assert_eq!(f.notifier.count(NotificationKind::DonorAssigned), 1);
    }

    #[test]
    fn assign_donor_rejects_incompatible_donor_and_wrong_state() {
        let f = fixture();
        let demand = demand(&f, BloodType::ONeg, 1);
        let wf = f.engine.create(demand.reference()).unwrap();

        let err = f
            .engine
            .assign_donor(wf.id, donor(&f, BloodType::APos), None)
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(_)));

        let wf = f.engine.assign_donor(wf.id, donor(&f, BloodType::ONeg), None).unwrap();
        assert_eq!(wf.status, WorkflowStatus::DonorAssigned);
        let err = f
            .engine
            .assign_donor(wf.id, donor(&f, BloodType::ONeg), None)
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidState { .. }));
    }

    #[test]
    fn assign_unknown_donor_is_not_found_and_leaves_workflow_untouched() {
        let f = fixture();
        let demand = demand(&f, BloodType::APos, 1);
        let wf = f.engine.create(demand.reference()).unwrap();
        let err = f.engine.assign_donor(wf.id, Uuid::new_v4(), None).unwrap_err();
        assert!(matches!(err, FulfillmentError::NotFound { entity: EntityKind::Donor, .. }));
        assert_eq!(f.engine.get(wf.id).unwrap(), wf);
    }

    #[test]
    fn fulfill_from_inventory_checks_the_unit() {
        let f = fixture();
        let demand = demand(&f, BloodType::OPos, 2);
        let wf = f.engine.create_with(demand.reference(), false).unwrap();

        let wrong_type = stock(&f, BloodType::APos, 2, 10);
        let err = f.engine.fulfill_from_inventory(wf.id, wrong_type.id).unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(_)));

        let too_small = stock(&f, BloodType::OPos, 1, 10);
        let err = f.engine.fulfill_from_inventory(wf.id, too_small.id).unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(_)));

        let good = stock(&f, BloodType::OPos, 2, 10);
        let done = f.engine.fulfill_from_inventory(wf.id, good.id).unwrap();
        assert_eq!(done.status, WorkflowStatus::CompletedFromInventory);
        assert_eq!(done.reserved_unit_id, Some(good.id));
        assert_eq!(f.engine.demand(demand.id).unwrap().status, DemandStatus::Fulfilled);
    }

    #[test]
    fn fulfill_with_reserved_unit_is_a_conflict_without_mutation() {
        let f = fixture();
        let demand = demand(&f, BloodType::OPos, 1);
        let wf = f.engine.create_with(demand.reference(), false).unwrap();
        let unit = stock(&f, BloodType::OPos, 1, 10);
        f.allocator.reserve(unit.id, Uuid::new_v4()).unwrap();

        let err = f.engine.fulfill_from_inventory(wf.id, unit.id).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(f.engine.get(wf.id).unwrap().status, WorkflowStatus::Created);
    }

    #[test]
    fn complete_donation_stocks_a_new_unit_and_defers_the_donor() {
        let f = fixture();
        let demand = demand(&f, BloodType::BPos, 1);
        let wf = f.engine.create_with(demand.reference(), false).unwrap();
        let donor_id = donor(&f, BloodType::BNeg);
        let site = location(&f);
        f.engine.assign_donor(wf.id, donor_id, None).unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let (wf, unit) = f.engine.complete_donation(wf.id, date, site, 1).unwrap();

        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.donation.as_ref().unwrap().unit_id, unit.id);
        assert_eq!(unit.blood_type, BloodType::BNeg);
        assert_eq!(unit.status, InventoryStatus::Available);
        assert_eq!(
            unit.expires_at.date_naive(),
            NaiveDate::from_ymd_opt(2024, 2, 12).unwrap()
        );
        let donor = f.directory.donor(donor_id).unwrap();
        assert_eq!(donor.last_donation, Some(date));
        assert_eq!(donor.next_eligible, Some(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()));
        assert_eq!(f.engine.demand(demand.id).unwrap().status, DemandStatus::Fulfilled);
    }

    #[test]
    fn complete_donation_requires_a_donor() {
        let f = fixture();
        let demand = demand(&f, BloodType::BPos, 1);
        let wf = f.engine.create_with(demand.reference(), false).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = f
            .engine
            .complete_donation(wf.id, date, location(&f), 1)
            .unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidState { .. }));
    }

    /// Delegates to an in-memory directory but can refuse to record.
    struct RefusingDirectory {
        inner: Arc<InMemoryDirectory>,
        refuse: std::sync::atomic::AtomicBool,
    }

    impl Directory for RefusingDirectory {
        fn donor(&self, donor_id: Uuid) -> Result<Donor> {
            self.inner.donor(donor_id)
        }

        fn location(&self, location_id: Uuid) -> Result<Location> {
            self.inner.location(location_id)
        }

        fn record_donation(
            &self,
            donor_id: Uuid,
            donated_on: NaiveDate,
            next_eligible: NaiveDate,
        ) -> Result<()> {
            if self.refuse.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(FulfillmentError::conflict(
                    EntityKind::Donor,
                    donor_id,
                    "donor registry is read-only",
                ));
            }
            self.inner.record_donation(donor_id, donated_on, next_eligible)
        }

        fn restore_eligibility(
            &self,
            donor_id: Uuid,
            last_donation: Option<NaiveDate>,
            next_eligible: Option<NaiveDate>,
        ) -> Result<()> {
            self.inner
                .restore_eligibility(donor_id, last_donation, next_eligible)
        }
    }

    #[test]
    fn refused_donation_record_leaves_everything_as_it_was() {
        let f = fixture();
        let refusing = Arc::new(RefusingDirectory {
            inner: f.directory.clone(),
            refuse: std::sync::atomic::AtomicBool::new(true),
        });
        let units = Arc::new(Table::default());
        let engine = WorkflowEngine::new(
            Arc::new(Table::default()),
            Arc::new(Table::default()),
            Arc::new(InventoryAllocator::new(units.clone())),
            refusing.clone(),
            f.notifier.clone(),
            WorkflowSettings::default(),
        );
        let demand = engine
            .submit_demand(
                Demand::new(
                    RequestKind::Standard,
                    BloodType::BPos,
                    ComponentKind::RedCells,
                    1,
                    Priority::Routine,
                    "Ward 3",
                )
                .unwrap(),
            )
            .unwrap();
        let wf = engine.create_with(demand.reference(), false).unwrap();
        let donor_id = donor(&f, BloodType::BPos);
        let site = location(&f);
        engine.assign_donor(wf.id, donor_id, None).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let err = engine.complete_donation(wf.id, date, site, 1).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(engine.get(wf.id).unwrap().status, WorkflowStatus::DonorAssigned);
        assert_eq!(engine.demand(demand.id).unwrap().status, DemandStatus::Open);
        assert!(units.is_empty());
        let untouched = f.directory.donor(donor_id).unwrap();
        assert_eq!(untouched.last_donation, None);
        assert_eq!(untouched.next_eligible, None);

        refusing
            .refuse
            .store(false, std::sync::atomic::Ordering::SeqCst);
        let (wf, unit) = engine.complete_donation(wf.id, date, site, 1).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(units.len(), 1);
        assert_eq!(unit.source_workflow, Some(wf.id));
        assert_eq!(engine.demand(demand.id).unwrap().status, DemandStatus::Fulfilled);
    }

    #[test]
    fn donation_dates_past_the_calendar_are_rejected() {
        let settings = WorkflowSettings {
            donation_interval_days: 200_000_000,
            ..WorkflowSettings::default()
        };
        let f = fixture_with(RecordingNotifier::new(), settings);
        let demand = demand(&f, BloodType::BPos, 1);
        let wf = f.engine.create_with(demand.reference(), false).unwrap();
        f.engine
            .assign_donor(wf.id, donor(&f, BloodType::BPos), None)
            .unwrap();
        let site = location(&f);

        for date in [NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), NaiveDate::MAX] {
            let err = f.engine.complete_donation(wf.id, date, site, 1).unwrap_err();
            assert!(matches!(err, FulfillmentError::Validation(_)));
        }
        assert_eq!(f.engine.get(wf.id).unwrap().status, WorkflowStatus::DonorAssigned);
        assert_eq!(f.engine.demand(demand.id).unwrap().status, DemandStatus::Open);
    }

    #[test]
    fn strict_fulfillment_refuses_a_demand_that_left_open() {
        let f = fixture();
        let demand = demand(&f, BloodType::APos, 1);
        f.engine.cancel_demand(demand.id).unwrap();

        let err = f.engine.fulfill_demand(demand.id, true).unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidState { entity: EntityKind::Demand, .. }));
        assert!(f.engine.fulfill_demand(demand.id, false).unwrap().is_none());
    }

    #[test]
    fn reopen_never_clobbers_a_later_write() {
        let f = fixture();
        let demand = demand(&f, BloodType::APos, 1);
        let undo = f.engine.fulfill_demand(demand.id, true).unwrap().unwrap();
        f.engine
            .demands
            .update(demand.id, |d| {
                d.requester = "Ward 9".to_string();
                Ok(())
            })
            .unwrap();

        f.engine.reopen_demand(undo);
        let stored = f.engine.demand(demand.id).unwrap();
        assert_eq!(stored.status, DemandStatus::Fulfilled);
        assert_eq!(stored.requester, "Ward 9");
    }

    #[test]
    fn deadline_limits_auto_match_and_manual_fulfillment() {
        let f = fixture();
        let short = stock(&f, BloodType::ONeg, 1, 2);
        let demand = f
            .engine
            .submit_demand(
                Demand::new(
                    RequestKind::Standard,
                    BloodType::ONeg,
                    ComponentKind::RedCells,
                    1,
                    Priority::Urgent,
                    "Theatre",
                )
                .unwrap()
                .with_deadline(Utc::now() + Duration::days(4)),
            )
            .unwrap();

        let wf = f.engine.create(demand.reference()).unwrap();
        assert_eq!(wf.status, WorkflowStatus::Created);
        let err = f.engine.fulfill_from_inventory(wf.id, short.id).unwrap_err();
        assert!(matches!(err, FulfillmentError::Validation(_)));
        assert_eq!(f.allocator.get(short.id).unwrap().status, InventoryStatus::Available);

        let long = stock(&f, BloodType::ONeg, 1, 9);
        let done = f.engine.fulfill_from_inventory(wf.id, long.id).unwrap();
        assert_eq!(done.reserved_unit_id, Some(long.id));
    }

    #[test]
    fn confirm_requires_scheduled() {
        let f = fixture();
        let demand = demand(&f, BloodType::APos, 1);
        let wf = f.engine.create(demand.reference()).unwrap();
        let err = f.engine.confirm_appointment(wf.id).unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidState { .. }));

        let date = Utc::now().date_naive() + Duration::days(2);
        f.engine
            .assign_donor(wf.id, donor(&f, BloodType::APos), Some((date, location(&f))))
            .unwrap();
        let wf = f.engine.confirm_appointment(wf.id).unwrap();
        assert!(wf.appointment.unwrap().confirmed);
        assert_eq!(wf.status, WorkflowStatus::Scheduled);
    }

    #[test]
    fn cancel_is_refused_once_completed() {
        let f = fixture();
        stock(&f, BloodType::APos, 1, 10);
        let demand = demand(&f, BloodType::APos, 1);
        let wf = f.engine.create(demand.reference()).unwrap();
        assert_eq!(wf.status, WorkflowStatus::CompletedFromInventory);

        let err = f.engine.cancel(wf.id, "changed my mind").unwrap_err();
        assert!(matches!(err, FulfillmentError::InvalidState { .. }));
        assert_eq!(f.engine.get(wf.id).unwrap(), wf);
    }

    #[test]
    fn cancel_deactivates_and_records_reason() {
        let f = fixture();
        let demand = demand(&f, BloodType::APos, 1);
        let wf = f.engine.create(demand.reference()).unwrap();
        let wf = f.engine.cancel(wf.id, "patient discharged").unwrap();
        assert_eq!(wf.status, WorkflowStatus::Cancelled);
        assert!(!wf.is_active);
        assert_eq!(wf.note.as_deref(), Some("patient discharged"));
        assert!(f.engine.cancel(wf.id, "again").is_err());
    }

    #[traced_test]
    #[test]
    fn failing_notifications_do_not_fail_transitions() {
        let f = fixture_with(RecordingNotifier::failing(), WorkflowSettings::default());
        let demand = demand(&f, BloodType::APos, 1);
        let wf = f.engine.create(demand.reference()).unwrap();
        let wf = f
            .engine
            .assign_donor(wf.id, donor(&f, BloodType::APos), None)
            .unwrap();
        assert_eq!(wf.status, WorkflowStatus::DonorAssigned);
        assert!(logs_contain("notification dropped"));
    }

    #[test]
    fn list_filters_by_status() {
        let f = fixture();
        for _ in 0..3 {
            let d = demand(&f, BloodType::AbPos, 1);
            f.engine.create(d.reference()).unwrap();
        }
        let d = demand(&f, BloodType::AbPos, 1);
        let wf = f.engine.create(d.reference()).unwrap();
        f.engine.cancel(wf.id, "dup").unwrap();

        let page = f.engine.list(
            &WorkflowFilter {
                status: Some(WorkflowStatus::Created),
                ..WorkflowFilter::default()
            },
            WorkflowSort::CreatedAt,
            SortDirection::Ascending,
            PageRequest::default(),
        );
        assert_eq!(page.total, 3);

        let active = f.engine.list(
            &WorkflowFilter {
                active_only: true,
                ..WorkflowFilter::default()
            },
            WorkflowSort::UpdatedAt,
            SortDirection::Descending,
            PageRequest::default(),
        );
        assert_eq!(active.total, 3);
    }
}
