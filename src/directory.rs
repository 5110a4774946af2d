/// Identity and location directory.
///
/// Donors and locations are owned by an external system. The engines only
/// need to resolve them and record completed donations.

use chrono::NaiveDate;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{EntityKind, FulfillmentError, Result};
use crate::models::{Donor, Location};

pub trait Directory: Send + Sync {
    fn donor(&self, donor_id: Uuid) -> Result<Donor>;

    fn location(&self, location_id: Uuid) -> Result<Location>;

    /// Record a completed donation and the donor's next eligible date.
    fn record_donation(&self, donor_id: Uuid, donated_on: NaiveDate, next_eligible: NaiveDate)
        -> Result<()>;

    /// Put back a donor's donation dates, undoing a `record_donation`.
    fn restore_eligibility(
        &self,
        donor_id: Uuid,
        last_donation: Option<NaiveDate>,
        next_eligible: Option<NaiveDate>,
    ) -> Result<()>;
}

/// Directory held in memory, used by the CLI and tests.
#[derive(Default)]
pub struct InMemoryDirectory {
    donors: DashMap<Uuid, Donor>,
    locations: DashMap<Uuid, Location>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_donor(&self, donor: Donor) -> Uuid {
        let id = donor.id;
        self.donors.insert(id, donor);
        id
    }

    pub fn add_location(&self, location: Location) -> Uuid {
        let id = location.id;
        self.locations.insert(id, location);
        id
    }

    pub fn set_location_active(&self, location_id: Uuid, active: bool) -> Result<()> {
        let mut location = self
            .locations
            .get_mut(&location_id)
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Location, location_id))?;
        location.active = active;
        Ok(())
    }

    pub fn set_next_eligible(&self, donor_id: Uuid, next_eligible: Option<NaiveDate>) -> Result<()> {
        let mut donor = self
            .donors
            .get_mut(&donor_id)
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Donor, donor_id))?;
        donor.next_eligible = next_eligible;
        Ok(())
    }

    pub fn donors(&self) -> Vec<Donor> {
        let mut donors: Vec<Donor> = self.donors.iter().map(|d| d.value().clone()).collect();
        donors.sort_by(|a, b| a.name.cmp(&b.name));
        donors
    }

    pub fn locations(&self) -> Vec<Location> {
        let mut locations: Vec<Location> =
            self.locations.iter().map(|l| l.value().clone()).collect();
        locations.sort_by(|a, b| a.name.cmp(&b.name));
        locations
    }
}

impl Directory for InMemoryDirectory {
    fn donor(&self, donor_id: Uuid) -> Result<Donor> {
        self.donors
            .get(&donor_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Donor, donor_id))
    }

    fn location(&self, location_id: Uuid) -> Result<Location> {
        self.locations
            .get(&location_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Location, location_id))
    }

    fn record_donation(
        &self,
        donor_id: Uuid,
        donated_on: NaiveDate,
        next_eligible: NaiveDate,
    ) -> Result<()> {
        let mut donor = self
            .donors
            .get_mut(&donor_id)
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Donor, donor_id))?;
        donor.last_donation = Some(donated_on);
        donor.next_eligible = Some(next_eligible);
        Ok(())
    }

    fn restore_eligibility(
        &self,
        donor_id: Uuid,
        last_donation: Option<NaiveDate>,
        next_eligible: Option<NaiveDate>,
    ) -> Result<()> {
        let mut donor = self
            .donors
            .get_mut(&donor_id)
            .ok_or_else(|| FulfillmentError::not_found(EntityKind::Donor, donor_id))?;
        donor.last_donation = last_donation;
        donor.next_eligible = next_eligible;
        Ok(())
    }
}
