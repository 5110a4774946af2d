/// Appointment request negotiation.
///
/// A donor asks for a slot and staff answer, or staff propose a slot and
/// the donor answers:
///
/// ```text
/// Pending ──┬─> Approved (staff) ──┬─> CheckedIn ──> Completed
///           ├─> Accepted (donor) ──┤
///           │                      └─> Cancelled
///           ├─> Rejected | Denied | Cancelled | Expired
/// ```
///
/// Approved and accepted requests hold one seat of capacity. The seat is
/// claimed and released inside the request's own row update and recorded
/// on the request, so it is taken once and given back once.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use strum::{Display, EnumString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::capacity::AppointmentCapacityLedger;
use crate::config::{EngineConfig, MAX_REQUEST_EXPIRY_HOURS};
use crate::directory::Directory;
use crate::error::{EntityKind, FulfillmentError, Result};
use crate::models::{
    AppointmentRequest, CancelledBy, ConfirmedSlot, RequestOrigin, RequestStatus, TimeSlot,
};
use crate::notify::{dispatch, NotificationKind, Notifier};
use crate::review::{ReviewBatch, ReviewQueue};
use crate::store::{Page, PageRequest, SortDirection, Table};

/// Staff answer to a donor-initiated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum StaffDecision {
    Approve,
    Reject,
    /// Donor deferred, e.g. failed screening.
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppointmentSettings {
    pub request_expiry: Duration,
}

impl Default for AppointmentSettings {
    fn default() -> Self {
        AppointmentSettings {
            request_expiry: Duration::hours(72),
        }
    }
}

impl From<&EngineConfig> for AppointmentSettings {
    fn from(config: &EngineConfig) -> Self {
        AppointmentSettings {
            request_expiry: Duration::hours(
                config
                    .scheduling
                    .request_expiry_hours
                    .clamp(1, MAX_REQUEST_EXPIRY_HOURS),
            ),
        }
    }
}

/// Enumerated sort keys for request listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestSort {
    #[default]
    CreatedAt,
    Date,
    ExpiresAt,
    /// Review order: urgent, priority, age.
    Review,
}

impl RequestSort {
    fn compare(&self, a: &AppointmentRequest, b: &AppointmentRequest) -> std::cmp::Ordering {
        match self {
            RequestSort::CreatedAt => a.created_at.cmp(&b.created_at),
            RequestSort::Date => a.date.cmp(&b.date).then(a.time_slot.cmp(&b.time_slot)),
            RequestSort::ExpiresAt => a.expires_at.cmp(&b.expires_at),
            RequestSort::Review => b.cmp(a),
        }
        .then(a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub origin: Option<RequestOrigin>,
    pub donor_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub date: Option<NaiveDate>,
}

impl RequestFilter {
    fn matches(&self, r: &AppointmentRequest) -> bool {
        self.status.map_or(true, |s| r.status == s)
            && self.origin.map_or(true, |o| r.origin == o)
            && self.donor_id.map_or(true, |d| r.donor_id == d)
            && self.location_id.map_or(true, |l| r.location_id == l)
            && self.date.map_or(true, |d| r.date == d)
    }
}

pub struct AppointmentRequestEngine {
    requests: Arc<Table<AppointmentRequest>>,
    ledger: Arc<AppointmentCapacityLedger>,
    directory: Arc<dyn Directory>,
    notifier: Arc<dyn Notifier>,
    settings: AppointmentSettings,
    // donor -> their single outstanding request
    outstanding: DashMap<Uuid, Uuid>,
}

impl AppointmentRequestEngine {
    pub fn new(
        requests: Arc<Table<AppointmentRequest>>,
        ledger: Arc<AppointmentCapacityLedger>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        settings: AppointmentSettings,
    ) -> Self {
        AppointmentRequestEngine {
            requests,
            ledger,
            directory,
            notifier,
            settings,
            outstanding: DashMap::new(),
        }
    }

    /// A donor asks for a slot.
    ///
    /// The donor must be eligible today, the location active, the date
    /// after today, the slot not fully booked, and the donor must not have
    /// another outstanding request.
    pub fn create_donor_initiated(
        &self,
        donor_id: Uuid,
        location_id: Uuid,
        date: NaiveDate,
        time_slot: TimeSlot,
    ) -> Result<AppointmentRequest> {
        let donor = self.directory.donor(donor_id)?;
        let today = Utc::now().date_naive();
        if !donor.is_eligible_on(today) {
            return Err(FulfillmentError::validation(format!(
                "donor {} is not eligible to donate until {}",
                donor_id,
                donor.next_eligible.unwrap_or(today)
            )));
        }
        self.ensure_location_open(location_id)?;
        ensure_future(date, today)?;

        let open = self
            .ledger
            .available_capacity(location_id, date)
            .get(&time_slot)
            .copied()
            .unwrap_or(0);
        if open == 0 {
            return Err(FulfillmentError::conflict(
                EntityKind::CapacitySlot,
                location_id,
                format!("{time_slot} on {date} is fully booked"),
            ));
        }

        let request = AppointmentRequest::new(
            donor_id,
            location_id,
            date,
            time_slot,
            RequestOrigin::DonorInitiated,
            Utc::now() + self.settings.request_expiry,
        );
        self.store_new(request)
    }

    /// Staff propose a slot to a donor, who then accepts or rejects it.
    pub fn create_staff_initiated(
        &self,
        donor_id: Uuid,
        location_id: Uuid,
        date: NaiveDate,
        time_slot: TimeSlot,
    ) -> Result<AppointmentRequest> {
        self.directory.donor(donor_id)?;
        self.ensure_location_open(location_id)?;
        ensure_future(date, Utc::now().date_naive())?;

        let request = AppointmentRequest::new(
            donor_id,
            location_id,
            date,
            time_slot,
            RequestOrigin::StaffInitiated,
            Utc::now() + self.settings.request_expiry,
        );
        let request = self.store_new(request)?;
        dispatch(
            self.notifier.as_ref(),
            donor_id,
            NotificationKind::AppointmentProposed,
            &format!("We'd like to see you on {date} ({time_slot}). Please accept or decline."),
        );
        Ok(request)
    }

    /// Staff answer a pending donor-initiated request.
    ///
    /// Approving claims a seat on the originally requested slot; a
    /// `confirmed` counter-proposal is recorded alongside it. Reject and
    /// deny leave capacity untouched.
    pub fn staff_respond(
        &self,
        request_id: Uuid,
        decision: StaffDecision,
        confirmed: Option<ConfirmedSlot>,
        notes: Option<String>,
    ) -> Result<AppointmentRequest> {
        if let Some(slot) = &confirmed {
            self.ensure_location_open(slot.location_id)?;
        }

        let request = self.requests.update(request_id, |req| {
            if req.origin != RequestOrigin::DonorInitiated {
                return Err(FulfillmentError::validation(format!(
                    "request {} was proposed by staff and awaits the donor's answer",
                    req.id
                )));
            }
            match decision {
                StaffDecision::Approve => {
                    req.transition(RequestStatus::Approved, "approve")?;
                    self.hold_capacity(req)?;
                    req.confirmed = confirmed;
                }
                StaffDecision::Reject => req.transition(RequestStatus::Rejected, "reject")?,
                StaffDecision::Deny => req.transition(RequestStatus::Denied, "deny")?,
            }
            req.staff_notes = notes;
            req.responded_at = Some(Utc::now());
            Ok(req.clone())
        })?;

        self.settle(&request);
        info!(
            %request_id,
            %decision,
            status = %request.status,
            claimed = ?request.claimed_slot,
            "staff responded to appointment request"
        );
        let (kind, message) = match decision {
            StaffDecision::Approve => {
                let (date, slot) = request
                    .confirmed
                    .map_or((request.date, request.time_slot), |c| (c.date, c.time_slot));
                (
                    NotificationKind::AppointmentApproved,
                    format!("Your appointment on {date} ({slot}) is approved"),
                )
            }
            StaffDecision::Reject | StaffDecision::Deny => (
                NotificationKind::AppointmentRejected,
                format!("Your appointment request for {} was not approved", request.date),
            ),
        };
        dispatch(self.notifier.as_ref(), request.donor_id, kind, &message);
        Ok(request)
    }

    /// The donor answers a staff proposal. Accepting claims a seat.
    pub fn donor_respond(
        &self,
        request_id: Uuid,
        accept: bool,
        notes: Option<String>,
    ) -> Result<AppointmentRequest> {
        let request = self.requests.update(request_id, |req| {
            if req.origin != RequestOrigin::StaffInitiated {
                return Err(FulfillmentError::validation(format!(
                    "request {} was made by the donor and awaits staff review",
                    req.id
                )));
            }
            if accept {
                req.transition(RequestStatus::Accepted, "accept")?;
                self.hold_capacity(req)?;
            } else {
                req.transition(RequestStatus::Rejected, "decline")?;
            }
            req.donor_accepted = accept;
            req.donor_notes = notes;
            req.responded_at = Some(Utc::now());
            Ok(req.clone())
        })?;

        self.settle(&request);
        info!(%request_id, accept, status = %request.status, "donor responded to proposal");
        Ok(request)
    }

    /// Cancel a pending, approved, or accepted request, giving back any
    /// seat it holds.
    pub fn cancel(&self, request_id: Uuid, by: CancelledBy) -> Result<AppointmentRequest> {
        let request = self.requests.update(request_id, |req| {
            req.transition(RequestStatus::Cancelled, "cancel")?;
            self.return_capacity(req)?;
            req.cancelled_by = Some(by);
            req.cancelled_at = Some(Utc::now());
            Ok(req.clone())
        })?;

        self.settle(&request);
        info!(%request_id, cancelled_by = %by, "appointment request cancelled");
        if by != CancelledBy::Donor {
            dispatch(
                self.notifier.as_ref(),
                request.donor_id,
                NotificationKind::AppointmentCancelled,
                &format!("Your appointment on {} was cancelled", request.date),
            );
        }
        Ok(request)
    }

    /// Expire every pending request whose deadline has passed.
    ///
    /// Pending requests never hold capacity, so the ledger is untouched.
    /// Returns the ids that changed.
    pub fn mark_expired(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let candidates = self
            .requests
            .filter(|r| r.status == RequestStatus::Pending && r.expires_at < now);

        let mut expired = Vec::new();
        for candidate in candidates {
            let result = self.requests.update(candidate.id, |req| {
                if req.status != RequestStatus::Pending || req.expires_at >= now {
                    return Ok(None);
                }
                req.transition(RequestStatus::Expired, "expire")?;
                Ok(Some(req.clone()))
            });
            match result {
                Ok(Some(request)) => {
                    self.settle(&request);
                    dispatch(
                        self.notifier.as_ref(),
                        request.donor_id,
                        NotificationKind::AppointmentExpired,
                        &format!("Your appointment request for {} expired", request.date),
                    );
                    expired.push(request.id);
                }
                Ok(None) => {}
                Err(e) => debug!(request_id = %candidate.id, error = %e, "skipped expiring request"),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "appointment requests expired");
        }
        expired
    }

    pub fn check_in(&self, request_id: Uuid) -> Result<AppointmentRequest> {
        let request = self.requests.update(request_id, |req| {
            req.transition(RequestStatus::CheckedIn, "check in")?;
            req.checked_in_at = Some(Utc::now());
            Ok(req.clone())
        })?;
        info!(%request_id, "donor checked in");
        Ok(request)
    }

    pub fn complete(&self, request_id: Uuid) -> Result<AppointmentRequest> {
        let request = self.requests.update(request_id, |req| {
            req.transition(RequestStatus::Completed, "complete")?;
            req.completed_at = Some(Utc::now());
            Ok(req.clone())
        })?;
        self.settle(&request);
        info!(%request_id, "appointment completed");
        Ok(request)
    }

    /// Record the workflow this appointment feeds.
    pub fn link_to_workflow(&self, request_id: Uuid, workflow_id: Uuid) -> Result<AppointmentRequest> {
        let request = self.requests.update(request_id, |req| {
            if !req.status.is_outstanding() && req.status != RequestStatus::Completed {
                return Err(FulfillmentError::invalid_state(
                    EntityKind::AppointmentRequest,
                    req.id,
                    "link",
                    req.status,
                ));
            }
            req.workflow_id = Some(workflow_id);
            Ok(req.clone())
        })?;
        info!(%request_id, %workflow_id, "appointment linked to workflow");
        Ok(request)
    }

    /// Set review urgency and priority on a pending request.
    pub fn prioritize(&self, request_id: Uuid, urgent: bool, priority: i32) -> Result<AppointmentRequest> {
        self.update_pending(request_id, "reprioritize", |req| {
            req.urgent = urgent;
            req.priority = priority;
        })
    }

    /// Move a pending request's expiry deadline.
    pub fn set_expiry(&self, request_id: Uuid, expires_at: DateTime<Utc>) -> Result<AppointmentRequest> {
        self.update_pending(request_id, "change the expiry of", |req| {
            req.expires_at = expires_at;
        })
    }

    pub fn get(&self, request_id: Uuid) -> Result<AppointmentRequest> {
        self.requests.require(request_id)
    }

    /// The donor's outstanding request, if any.
    pub fn outstanding_for(&self, donor_id: Uuid) -> Option<AppointmentRequest> {
        let request_id = self.outstanding.get(&donor_id).map(|r| *r.value())?;
        self.requests
            .get(request_id)
            .filter(|r| r.status.is_outstanding())
    }

    pub fn list(
        &self,
        filter: &RequestFilter,
        sort: RequestSort,
        direction: SortDirection,
        page: PageRequest,
    ) -> Page<AppointmentRequest> {
        self.requests.page(
            |r| filter.matches(r),
            |a, b| direction.apply(sort.compare(a, b)),
            page,
        )
    }

    /// Donor-initiated requests awaiting staff, in review order.
    pub fn review_queue(&self, location_id: Option<Uuid>) -> Vec<AppointmentRequest> {
        self.pending_queue(location_id).into_ordered()
    }

    /// Decide every pending request in review order.
    ///
    /// Approvals that find their slot full land in the batch's failures and
    /// stay pending.
    pub fn review_pending(
        &self,
        location_id: Option<Uuid>,
        mut decide: impl FnMut(&AppointmentRequest) -> StaffDecision,
    ) -> ReviewBatch {
        let mut queue = self.pending_queue(location_id);
        let batch = queue.process(|req| self.staff_respond(req.id, decide(req), None, None));
        info!(
            total = batch.total,
            processed = batch.processed.len(),
            failed = batch.failed.len(),
            "review pass finished"
        );
        batch
    }

    fn pending_queue(&self, location_id: Option<Uuid>) -> ReviewQueue {
        self.requests
            .filter(|r| {
                r.status == RequestStatus::Pending
                    && r.origin == RequestOrigin::DonorInitiated
                    && location_id.map_or(true, |l| r.location_id == l)
            })
            .into_iter()
            .collect()
    }

    fn update_pending(
        &self,
        request_id: Uuid,
        action: &'static str,
        f: impl FnOnce(&mut AppointmentRequest),
    ) -> Result<AppointmentRequest> {
        self.requests.update(request_id, |req| {
            if req.status != RequestStatus::Pending {
                return Err(FulfillmentError::invalid_state(
                    EntityKind::AppointmentRequest,
                    req.id,
                    action,
                    req.status,
                ));
            }
            f(req);
            Ok(req.clone())
        })
    }

    fn store_new(&self, request: AppointmentRequest) -> Result<AppointmentRequest> {
        self.claim_outstanding(request.donor_id, request.id)?;
        if let Err(e) = self.requests.insert(request.clone()) {
            self.clear_outstanding(request.donor_id, request.id);
            return Err(e);
        }
        info!(
            request_id = %request.id,
            donor_id = %request.donor_id,
            location_id = %request.location_id,
            date = %request.date,
            time_slot = %request.time_slot,
            origin = %request.origin,
            "appointment request created"
        );
        Ok(request)
    }

    /// Register `request_id` as the donor's outstanding request.
    ///
    /// An indexed id with no row yet belongs to a create still in flight
    /// and counts as outstanding.
    fn claim_outstanding(&self, donor_id: Uuid, request_id: Uuid) -> Result<()> {
        match self.outstanding.entry(donor_id) {
            Entry::Vacant(slot) => {
                slot.insert(request_id);
                Ok(())
            }
            Entry::Occupied(mut slot) => {
                let current = *slot.get();
                let live = self
                    .requests
                    .get(current)
                    .map_or(true, |r| r.status.is_outstanding());
                if live {
                    return Err(FulfillmentError::conflict(
                        EntityKind::AppointmentRequest,
                        current,
                        format!("donor {donor_id} already has an outstanding request"),
                    ));
                }
                slot.insert(request_id);
                Ok(())
            }
        }
    }

    fn clear_outstanding(&self, donor_id: Uuid, request_id: Uuid) {
        self.outstanding
            .remove_if(&donor_id, |_, current| *current == request_id);
    }

    /// Drop the outstanding index entry once a request has settled.
    fn settle(&self, request: &AppointmentRequest) {
        if !request.status.is_outstanding() {
            self.clear_outstanding(request.donor_id, request.id);
        }
    }

    fn hold_capacity(&self, req: &mut AppointmentRequest) -> Result<()> {
        let key = self.ledger.claim(req.location_id, req.time_slot, req.date)?;
        req.claimed_slot = key;
        req.holds_capacity = true;
        Ok(())
    }

    fn return_capacity(&self, req: &mut AppointmentRequest) -> Result<()> {
        if req.holds_capacity {
            if let Some(key) = req.claimed_slot {
                self.ledger.release(key)?;
            }
            req.holds_capacity = false;
        }
        Ok(())
    }

    fn ensure_location_open(&self, location_id: Uuid) -> Result<()> {
        let location = self.directory.location(location_id)?;
        if !location.active {
            return Err(FulfillmentError::validation(format!(
                "location {} is not accepting donors",
                location.name
            )));
        }
        Ok(())
    }
}

fn ensure_future(date: NaiveDate, today: NaiveDate) -> Result<()> {
    if date <= today {
        return Err(FulfillmentError::validation(format!(
            "appointment date {date} must be after {today}"
        )));
    }
    Ok(())
}
