/// Wiring and cross-entity operations.
///
/// `DonationService` builds every engine over one shared store. Operations
/// that touch a workflow and an appointment request together live here,
/// each as an explicit sequence of single-entity steps. Cancelling one side
/// never cancels the other unless the caller asks for it.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::appointment::{AppointmentRequestEngine, AppointmentSettings};
use crate::capacity::AppointmentCapacityLedger;
use crate::config::EngineConfig;
use crate::directory::Directory;
use crate::error::{EntityKind, FulfillmentError, Result};
use crate::inventory::InventoryAllocator;
use crate::models::{
    AppointmentRequest, CancelledBy, Demand, DonationWorkflow, InventoryUnit, RequestStatus,
    TimeSlot,
};
use crate::notify::Notifier;
use crate::store::{RetryPolicy, Table};
use crate::workflow::{WorkflowEngine, WorkflowSettings};

/// What a housekeeping sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_units: Vec<Uuid>,
    pub expired_requests: Vec<Uuid>,
}

pub struct DonationService {
    config: EngineConfig,
    inventory: Arc<InventoryAllocator>,
    ledger: Arc<AppointmentCapacityLedger>,
    workflows: WorkflowEngine,
    appointments: AppointmentRequestEngine,
}

impl DonationService {
    pub fn new(config: EngineConfig, directory: Arc<dyn Directory>, notifier: Arc<dyn Notifier>) -> Self {
        let retry = RetryPolicy::from(&config.store);
        let requests = Arc::new(Table::new(retry));

        let inventory = Arc::new(InventoryAllocator::new(Arc::new(Table::new(retry))));
        let ledger = Arc::new(AppointmentCapacityLedger::new(
            Arc::new(Table::new(retry)),
            requests.clone(),
            config.scheduling.default_slot_capacity,
        ));
        let workflows = WorkflowEngine::new(
            Arc::new(Table::new(retry)),
            Arc::new(Table::new(retry)),
            inventory.clone(),
            directory.clone(),
            notifier.clone(),
            WorkflowSettings::from(&config),
        );
        let appointments = AppointmentRequestEngine::new(
            requests,
            ledger.clone(),
            directory,
            notifier,
            AppointmentSettings::from(&config),
        );

        DonationService {
            config,
            inventory,
            ledger,
            workflows,
            appointments,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn inventory(&self) -> &InventoryAllocator {
        &self.inventory
    }

    pub fn ledger(&self) -> &AppointmentCapacityLedger {
        &self.ledger
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.workflows
    }

    pub fn appointments(&self) -> &AppointmentRequestEngine {
        &self.appointments
    }

    /// Register a demand and start its first workflow.
    pub fn submit_demand(&self, demand: Demand) -> Result<(Demand, DonationWorkflow)> {
        let demand = self.workflows.submit_demand(demand)?;
        let workflow = self.workflows.create(demand.reference())?;
        Ok((demand, workflow))
    }

    /// Feed an approved or accepted appointment into a workflow.
    ///
    /// An unassigned workflow takes the request's donor. The workflow is
    /// scheduled on the confirmed slot when staff proposed one, otherwise
    /// on the requested one, and marked confirmed.
    pub fn link_appointment(
        &self,
        request_id: Uuid,
        workflow_id: Uuid,
    ) -> Result<(AppointmentRequest, DonationWorkflow)> {
        let request = self.appointments.get(request_id)?;
        if !matches!(
            request.status,
            RequestStatus::Approved | RequestStatus::Accepted
        ) {
            return Err(FulfillmentError::invalid_state(
                EntityKind::AppointmentRequest,
                request_id,
                "link",
                request.status,
            ));
        }
        let workflow = self.workflows.get(workflow_id)?;
        match workflow.donor_id {
            None => {
                self.workflows
                    .assign_donor(workflow_id, request.donor_id, None)?;
            }
            Some(donor_id) if donor_id != request.donor_id => {
                return Err(FulfillmentError::validation(format!(
                    "workflow {workflow_id} is assigned to another donor"
                )));
            }
            Some(_) => {}
        }

        let (date, location_id, _) = appointment_slot(&request);
        self.workflows
            .schedule_appointment(workflow_id, Some(request_id), date, location_id)?;
        let workflow = self.workflows.confirm_appointment(workflow_id)?;
        let request = self.appointments.link_to_workflow(request_id, workflow_id)?;

        info!(%request_id, %workflow_id, %date, "appointment feeds workflow");
        Ok((request, workflow))
    }

    /// Record the donation made at a linked appointment.
    ///
    /// Checks the donor in if that has not happened yet, completes the
    /// workflow's donation, then completes the request.
    pub fn complete_appointment(
        &self,
        request_id: Uuid,
        donated_on: NaiveDate,
        quantity: u32,
    ) -> Result<(AppointmentRequest, DonationWorkflow, InventoryUnit)> {
        let request = self.appointments.get(request_id)?;
        let workflow_id = request.workflow_id.ok_or_else(|| {
            FulfillmentError::validation(format!("request {request_id} is not linked to a workflow"))
        })?;
        if request.status != RequestStatus::CheckedIn {
            self.appointments.check_in(request_id)?;
        }

        let (_, location_id, _) = appointment_slot(&request);
        let (workflow, unit) =
            self.workflows
                .complete_donation(workflow_id, donated_on, location_id, quantity)?;
        let request = self.appointments.complete(request_id)?;
        Ok((request, workflow, unit))
    }

    /// Cancel an appointment request and then its linked workflow.
    ///
    /// The workflow is left as is when it already finished.
    pub fn cancel_linked(
        &self,
        request_id: Uuid,
        by: CancelledBy,
        reason: &str,
    ) -> Result<(AppointmentRequest, Option<DonationWorkflow>)> {
        let request = self.appointments.cancel(request_id, by)?;
        let workflow = match request.workflow_id {
            Some(workflow_id) => Some(self.cancel_if_open(workflow_id, reason)?),
            None => None,
        };
        Ok((request, workflow))
    }

    /// Cancel a workflow and then the appointment request feeding it.
    pub fn cancel_workflow_and_appointment(
        &self,
        workflow_id: Uuid,
        reason: &str,
    ) -> Result<(DonationWorkflow, Option<AppointmentRequest>)> {
        let workflow = self.workflows.cancel(workflow_id, reason)?;
        let linked = workflow.appointment.as_ref().and_then(|a| a.request_id);
        let request = match linked {
            Some(request_id) => {
                let request = self.appointments.get(request_id)?;
                if request.status.can_transition_to(RequestStatus::Cancelled) {
                    Some(self.appointments.cancel(request_id, CancelledBy::Staff)?)
                } else {
                    Some(request)
                }
            }
            None => None,
        };
        Ok((workflow, request))
    }

    /// Expire stale stock and overdue pending requests.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let report = SweepReport {
            expired_units: self.inventory.expire_units(now),
            expired_requests: self.appointments.mark_expired(now),
        };
        info!(
            units = report.expired_units.len(),
            requests = report.expired_requests.len(),
            "housekeeping sweep finished"
        );
        report
    }

    fn cancel_if_open(&self, workflow_id: Uuid, reason: &str) -> Result<DonationWorkflow> {
        let workflow = self.workflows.get(workflow_id)?;
        if workflow.status.is_terminal() {
            warn!(%workflow_id, status = %workflow.status, "linked workflow already finished");
            return Ok(workflow);
        }
        self.workflows.cancel(workflow_id, reason)
    }
}

/// Where the appointment takes place: the staff-confirmed slot if any.
fn appointment_slot(request: &AppointmentRequest) -> (NaiveDate, Uuid, TimeSlot) {
    request.confirmed.map_or(
        (request.date, request.location_id, request.time_slot),
        |c| (c.date, c.location_id, c.time_slot),
    )
}
