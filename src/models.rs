/// Data models for the donation fulfillment engine.
///
/// This module defines the core data structures used throughout the system:
/// - BloodType / ComponentKind: what is demanded and what is stocked
/// - Demand: a routine or emergency request for blood
/// - InventoryUnit: one stored quantity of a blood component
/// - DonationWorkflow: one attempt to fulfill a demand
/// - AppointmentRequest: a donor/location/time-slot negotiation
/// - CapacitySlot: configured donor capacity at a location
///
/// Every status is a closed enum. Strings are parsed at the boundary with
/// `FromStr` and rejected when unknown.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::error::{FulfillmentError, Result};
use crate::store::Entity;

/// ABO/Rh blood type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter,
    Serialize, Deserialize,
)]
pub enum BloodType {
    #[strum(serialize = "O-")]
    #[serde(rename = "O-")]
    ONeg,
    #[strum(serialize = "O+")]
    #[serde(rename = "O+")]
    OPos,
    #[strum(serialize = "A-")]
    #[serde(rename = "A-")]
    ANeg,
    #[strum(serialize = "A+")]
    #[serde(rename = "A+")]
    APos,
    #[strum(serialize = "B-")]
    #[serde(rename = "B-")]
    BNeg,
    #[strum(serialize = "B+")]
    #[serde(rename = "B+")]
    BPos,
    #[strum(serialize = "AB-")]
    #[serde(rename = "AB-")]
    AbNeg,
    #[strum(serialize = "AB+")]
    #[serde(rename = "AB+")]
    AbPos,
}

impl BloodType {
    pub const ALL: [BloodType; 8] = [
        BloodType::ONeg,
        BloodType::OPos,
        BloodType::ANeg,
        BloodType::APos,
        BloodType::BNeg,
        BloodType::BPos,
        BloodType::AbNeg,
        BloodType::AbPos,
    ];

    pub fn is_rh_negative(&self) -> bool {
        matches!(
            self,
            BloodType::ONeg | BloodType::ANeg | BloodType::BNeg | BloodType::AbNeg
        )
    }
}

/// Blood product derived from a donation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter,
    Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum ComponentKind {
    WholeBlood,
    RedCells,
    Plasma,
    Platelets,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::WholeBlood,
        ComponentKind::RedCells,
        ComponentKind::Plasma,
        ComponentKind::Platelets,
    ];

    /// Storage life of the component in days.
    pub fn shelf_life_days(&self) -> i64 {
        match self {
            ComponentKind::WholeBlood => 35,
            ComponentKind::RedCells => 42,
            ComponentKind::Plasma => 365,
            ComponentKind::Platelets => 5,
        }
    }

    /// Expiration timestamp of a unit collected on `collected_on`.
    pub fn expiration_for(&self, collected_on: NaiveDate) -> Result<DateTime<Utc>> {
        let expires_on = collected_on
            .checked_add_signed(Duration::days(self.shelf_life_days()))
            .ok_or_else(|| {
                FulfillmentError::validation(format!(
                    "{self} collected on {collected_on} expires past the supported calendar"
                ))
            })?;
        Ok(expires_on.and_time(NaiveTime::MIN).and_utc())
    }
}

/// Urgency of a demand.
///
/// Higher numeric values indicate higher priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum Priority {
    Routine = 1,
    Urgent = 2,
    Emergency = 3,
}

impl Priority {
    pub fn name(&self) -> &str {
        match self {
            Priority::Routine => "ROUTINE",
            Priority::Urgent => "URGENT",
            Priority::Emergency => "EMERGENCY",
        }
    }
}

/// Fixed appointment time-slot labels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter,
    Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum TimeSlot {
    Morning,
    Afternoon,
    Evening,
}

impl TimeSlot {
    pub const ALL: [TimeSlot; 3] = [TimeSlot::Morning, TimeSlot::Afternoon, TimeSlot::Evening];

    /// Clock range covered by the slot, end exclusive.
    pub fn hours(&self) -> (NaiveTime, NaiveTime) {
        let (start, end) = match self {
            TimeSlot::Morning => (8, 12),
            TimeSlot::Afternoon => (12, 16),
            TimeSlot::Evening => (16, 20),
        };
        (
            NaiveTime::from_hms_opt(start, 0, 0).unwrap_or(NaiveTime::MIN),
            NaiveTime::from_hms_opt(end, 0, 0).unwrap_or(NaiveTime::MIN),
        )
    }

    /// Check if a clock time falls within this slot.
    pub fn contains(&self, time: NaiveTime) -> bool {
        let (start, end) = self.hours();
        start <= time && time < end
    }
}

/// Kind of source demand a workflow fulfills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(ascii_case_insensitive)]
pub enum RequestKind {
    Standard,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum DemandStatus {
    Open,
    Fulfilled,
    Cancelled,
}

/// A request for blood from a hospital or ward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demand {
    pub id: Uuid,
    pub kind: RequestKind,
    pub blood_type: BloodType,
    pub component: ComponentKind,
    pub quantity: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub requester: String,
    pub status: DemandStatus,
    pub created_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl Demand {
    /// Create a new open demand with validation.
    ///
    /// Emergency demands always carry `Priority::Emergency`.
    pub fn new(
        kind: RequestKind,
        blood_type: BloodType,
        component: ComponentKind,
        quantity: u32,
        priority: Priority,
        requester: impl Into<String>,
    ) -> Result<Self> {
        if quantity == 0 {
            return Err(FulfillmentError::validation("demand quantity must be positive"));
        }
        let requester = requester.into();
        if requester.trim().is_empty() {
            return Err(FulfillmentError::validation("demand requester cannot be empty"));
        }
        let priority = match kind {
            RequestKind::Emergency => Priority::Emergency,
            RequestKind::Standard => priority,
        };

        Ok(Demand {
            id: Uuid::new_v4(),
            kind,
            blood_type,
            component,
            quantity,
            deadline: None,
            priority,
            requester,
            status: DemandStatus::Open,
            created_at: Utc::now(),
            fulfilled_at: None,
        })
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn reference(&self) -> DemandRef {
        DemandRef {
            id: self.id,
            kind: self.kind,
        }
    }
}

/// Pointer from a workflow back to its source demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DemandRef {
    pub id: Uuid,
    pub kind: RequestKind,
}

/// A registered blood donor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donor {
    pub id: Uuid,
    pub name: String,
    pub blood_type: BloodType,
    pub last_donation: Option<NaiveDate>,
    pub next_eligible: Option<NaiveDate>,
}

impl Donor {
    /// Create a new donor with validation.
    pub fn new(name: impl Into<String>, blood_type: BloodType) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FulfillmentError::validation("donor name cannot be empty"));
        }
        Ok(Donor {
            id: Uuid::new_v4(),
            name,
            blood_type,
            last_donation: None,
            next_eligible: None,
        })
    }

    /// A donor with no recorded eligibility date may donate any day.
    pub fn is_eligible_on(&self, date: NaiveDate) -> bool {
        self.next_eligible.map_or(true, |next| next <= date)
    }
}

/// A physical donation site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

impl Location {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(FulfillmentError::validation("location name cannot be empty"));
        }
        Ok(Location {
            id: Uuid::new_v4(),
            name,
            active: true,
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum InventoryStatus {
    Available,
    Reserved,
    Used,
    Discarded,
    Expired,
}

impl InventoryStatus {
    /// Returns true if moving from self to `next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: InventoryStatus) -> bool {
        use InventoryStatus::*;
        matches!(
            (self, next),
            (Available, Reserved)
                | (Reserved, Used)
                | (Reserved, Available)
                | (Available, Expired)
                | (Reserved, Expired)
                | (Available, Discarded)
        )
    }
}

/// One collected, storable quantity of a blood component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryUnit {
    pub id: Uuid,
    pub blood_type: BloodType,
    pub component: ComponentKind,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
    pub status: InventoryStatus,
    /// Workflow whose donation produced this unit.
    pub source_workflow: Option<Uuid>,
    /// Workflow currently holding the reservation.
    pub reserved_for: Option<Uuid>,
    /// Creation order, used to break expiry ties.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl InventoryUnit {
    /// Create a new available unit with validation.
    pub fn new(
        blood_type: BloodType,
        component: ComponentKind,
        quantity: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        if quantity == 0 {
            return Err(FulfillmentError::validation("unit quantity must be positive"));
        }
        Ok(InventoryUnit {
            id: Uuid::new_v4(),
            blood_type,
            component,
            quantity,
            expires_at,
            status: InventoryStatus::Available,
            source_workflow: None,
            reserved_for: None,
            sequence: 0,
            created_at: Utc::now(),
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum WorkflowStatus {
    Created,
    DonorAssigned,
    Scheduled,
    CompletedFromInventory,
    Completed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::CompletedFromInventory
                | WorkflowStatus::Completed
                | WorkflowStatus::Cancelled
        )
    }

    /// Returns true if transitioning from self to `next` is valid.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Created, DonorAssigned)
            | (Created, Scheduled)
            | (Created, CompletedFromInventory)
            | (DonorAssigned, Scheduled)
            | (DonorAssigned, CompletedFromInventory)
            | (DonorAssigned, Completed)
            | (Scheduled, CompletedFromInventory)
            | (Scheduled, Completed) => true,
            (current, Cancelled) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Appointment details attached to a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentLink {
    pub request_id: Option<Uuid>,
    pub date: NaiveDate,
    pub location_id: Uuid,
    pub confirmed: bool,
}

/// What a completed donation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationRecord {
    pub date: NaiveDate,
    pub location_id: Uuid,
    pub quantity: u32,
    pub unit_id: Uuid,
}

/// One attempt to fulfill a single demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationWorkflow {
    pub id: Uuid,
    pub demand: DemandRef,
    pub blood_type: BloodType,
    pub component: ComponentKind,
    pub quantity: u32,
    pub status: WorkflowStatus,
    pub donor_id: Option<Uuid>,
    pub reserved_unit_id: Option<Uuid>,
    pub appointment: Option<AppointmentLink>,
    pub donation: Option<DonationRecord>,
    pub note: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DonationWorkflow {
    pub fn for_demand(demand: &Demand) -> Self {
        let now = Utc::now();
        DonationWorkflow {
            id: Uuid::new_v4(),
            demand: demand.reference(),
            blood_type: demand.blood_type,
            component: demand.component,
            quantity: demand.quantity,
            status: WorkflowStatus::Created,
            donor_id: None,
            reserved_unit_id: None,
            appointment: None,
            donation: None,
            note: None,
            is_active: true,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping the update time.
    pub(crate) fn transition(&mut self, next: WorkflowStatus, action: &'static str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FulfillmentError::invalid_state(
                crate::error::EntityKind::Workflow,
                self.id,
                action,
                self.status,
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum RequestOrigin {
    DonorInitiated,
    StaffInitiated,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
pub enum RequestStatus {
    Pending,
    Approved,
    Accepted,
    Rejected,
    Denied,
    Cancelled,
    Expired,
    CheckedIn,
    Completed,
}

impl RequestStatus {
    /// Returns true if transitioning from self to `next` is valid.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Accepted)
                | (Pending, Rejected)
                | (Pending, Denied)
                | (Pending, Cancelled)
                | (Pending, Expired)
                | (Approved, Cancelled)
                | (Accepted, Cancelled)
                | (Approved, CheckedIn)
                | (Accepted, CheckedIn)
                | (CheckedIn, Completed)
        )
    }

    /// Still occupying the donor's single outstanding request.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            RequestStatus::Pending
                | RequestStatus::Approved
                | RequestStatus::Accepted
                | RequestStatus::CheckedIn
        )
    }

    /// Counted against a slot's displayed availability.
    pub fn counts_against_capacity(&self) -> bool {
        !matches!(
            self,
            RequestStatus::Rejected
                | RequestStatus::Denied
                | RequestStatus::Cancelled
                | RequestStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
pub enum CancelledBy {
    Donor,
    Staff,
    System,
}

/// Staff counter-proposal recorded on approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedSlot {
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub location_id: Uuid,
}

/// Ledger key a request holds capacity on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub slot_id: Uuid,
    pub date: NaiveDate,
}

/// A donor/location/time-slot negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentRequest {
    pub id: Uuid,
    pub donor_id: Uuid,
    pub location_id: Uuid,
    pub date: NaiveDate,
    pub time_slot: TimeSlot,
    pub origin: RequestOrigin,
    pub status: RequestStatus,
    pub urgent: bool,
    pub priority: i32,
    pub confirmed: Option<ConfirmedSlot>,
    pub donor_accepted: bool,
    pub staff_notes: Option<String>,
    pub donor_notes: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub claimed_slot: Option<SlotKey>,
    /// Whether capacity is currently held, managed slot or not.
    pub holds_capacity: bool,
    pub workflow_id: Option<Uuid>,
    pub cancelled_by: Option<CancelledBy>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl AppointmentRequest {
    pub fn new(
        donor_id: Uuid,
        location_id: Uuid,
        date: NaiveDate,
        time_slot: TimeSlot,
        origin: RequestOrigin,
        expires_at: DateTime<Utc>,
    ) -> Self {
        AppointmentRequest {
            id: Uuid::new_v4(),
            donor_id,
            location_id,
            date,
            time_slot,
            origin,
            status: RequestStatus::Pending,
            urgent: false,
            priority: 0,
            confirmed: None,
            donor_accepted: false,
            staff_notes: None,
            donor_notes: None,
            expires_at,
            claimed_slot: None,
            holds_capacity: false,
            workflow_id: None,
            cancelled_by: None,
            created_at: Utc::now(),
            responded_at: None,
            checked_in_at: None,
            completed_at: None,
            cancelled_at: None,
        }
    }

    pub(crate) fn transition(&mut self, next: RequestStatus, action: &'static str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(FulfillmentError::invalid_state(
                crate::error::EntityKind::AppointmentRequest,
                self.id,
                action,
                self.status,
            ));
        }
        self.status = next;
        Ok(())
    }
}

impl PartialEq for AppointmentRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AppointmentRequest {}

impl PartialOrd for AppointmentRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AppointmentRequest {
    /// Compare requests for review queue ordering.
    ///
    /// Greater means served first: urgent before non-urgent, then higher
    /// priority, then older requests. The id keeps the order total.
    fn cmp(&self, other: &Self) -> Ordering {
        self.urgent
            .cmp(&other.urgent)
            .then(self.priority.cmp(&other.priority))
            .then(other.created_at.cmp(&self.created_at))
            .then(other.id.cmp(&self.id))
    }
}

/// Configured donor capacity for a location and time slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySlot {
    pub id: Uuid,
    pub location_id: Uuid,
    pub time_slot: TimeSlot,
    pub day_of_week: Option<Weekday>,
    pub effective_date: Option<NaiveDate>,
    pub expiry_date: Option<NaiveDate>,
    pub total_capacity: u32,
    pub active: bool,
}

impl CapacitySlot {
    /// Create a new slot definition with validation.
    pub fn new(
        location_id: Uuid,
        time_slot: TimeSlot,
        day_of_week: Option<Weekday>,
        effective_date: Option<NaiveDate>,
        expiry_date: Option<NaiveDate>,
        total_capacity: u32,
    ) -> Result<Self> {
        if let (Some(from), Some(until)) = (effective_date, expiry_date) {
            if until < from {
                return Err(FulfillmentError::validation(
                    "capacity expiry date must not precede its effective date",
                ));
            }
        }
        Ok(CapacitySlot {
            id: Uuid::new_v4(),
            location_id,
            time_slot,
            day_of_week,
            effective_date,
            expiry_date,
            total_capacity,
            active: true,
        })
    }

    /// Check if this definition governs `date`.
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.active
            && self.day_of_week.map_or(true, |day| day == date.weekday())
            && self.effective_date.map_or(true, |from| from <= date)
            && self.expiry_date.map_or(true, |until| date <= until)
    }

    /// Check if this definition could govern the same day as another.
    pub fn overlaps_with(&self, other: &CapacitySlot) -> bool {
        self.location_id == other.location_id
            && self.time_slot == other.time_slot
            && days_intersect(self.day_of_week, other.day_of_week)
            && ranges_intersect(
                (self.effective_date, self.expiry_date),
                (other.effective_date, other.expiry_date),
            )
    }
}

/// A weekday definition overrides a general one rather than clashing with it.
pub(crate) fn days_intersect(a: Option<Weekday>, b: Option<Weekday>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        (None, None) => true,
        _ => false,
    }
}

/// Open-ended date ranges; `None` is unbounded on that side.
pub(crate) fn ranges_intersect(
    a: (Option<NaiveDate>, Option<NaiveDate>),
    b: (Option<NaiveDate>, Option<NaiveDate>),
) -> bool {
    let start_a = a.0.unwrap_or(NaiveDate::MIN);
    let end_a = a.1.unwrap_or(NaiveDate::MAX);
    let start_b = b.0.unwrap_or(NaiveDate::MIN);
    let end_b = b.1.unwrap_or(NaiveDate::MAX);
    start_a <= end_b && start_b <= end_a
}

impl Entity for Demand {
    const KIND: crate::error::EntityKind = crate::error::EntityKind::Demand;
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Entity for InventoryUnit {
    const KIND: crate::error::EntityKind = crate::error::EntityKind::InventoryUnit;
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Entity for DonationWorkflow {
    const KIND: crate::error::EntityKind = crate::error::EntityKind::Workflow;
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Entity for AppointmentRequest {
    const KIND: crate::error::EntityKind = crate::error::EntityKind::AppointmentRequest;
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Entity for CapacitySlot {
    const KIND: crate::error::EntityKind = crate::error::EntityKind::CapacitySlot;
    fn id(&self) -> Uuid {
        self.id
    }
}
