/// Command-line interface for the donation engine.
///
/// An interactive menu over one in-memory `DonationService`: register
/// donors and sites, stock inventory, submit demands, and book and review
/// appointments.

use std::io::{self, Write};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use tracing::info;
use uuid::Uuid;

use donorflow::appointment::StaffDecision;
use donorflow::config::{load_config, EngineConfig};
use donorflow::directory::InMemoryDirectory;
use donorflow::inventory::{UnitFilter, UnitSort};
use donorflow::models::{
    BloodType, CapacitySlot, ComponentKind, Demand, Donor, InventoryStatus, InventoryUnit,
    Location, Priority, RequestKind, TimeSlot,
};
use donorflow::notify::TracingNotifier;
use donorflow::store::{PageRequest, SortDirection};
use donorflow::DonationService;

struct DonorFlowCli {
    service: DonationService,
    directory: Arc<InMemoryDirectory>,
    running: bool,
}

impl DonorFlowCli {
    fn new(config: EngineConfig) -> Self {
        let directory = Arc::new(InMemoryDirectory::new());
        let service = DonationService::new(config, directory.clone(), Arc::new(TracingNotifier));
        DonorFlowCli {
            service,
            directory,
            running: true,
        }
    }

    fn print_header(&self) {
        println!("\n{}", "=".repeat(60));
        println!("       BLOOD DONATION FULFILLMENT DESK");
        println!("{}", "=".repeat(60));
    }

    fn print_menu(&self) {
        println!("\n--- Main Menu ---");
        println!("1. Register donor");
        println!("2. Add donation site and capacity");
        println!("3. Stock inventory unit");
        println!("4. Submit blood demand");
        println!("5. Request appointment");
        println!("6. Review pending appointments");
        println!("7. View inventory");
        println!("8. View capacity");
        println!("9. Run expiry sweep");
        println!("10. Run demo");
        println!("11. Exit");
        println!("{}", "-".repeat(20));
    }

    /// Read one trimmed line. End of input stops the menu loop.
    fn get_input(&mut self, prompt: &str, default: Option<&str>) -> String {
        match default {
            Some(def) => print!("{} [{}]: ", prompt, def),
            None => print!("{}: ", prompt),
        }
        let _ = io::stdout().flush();

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) | Err(_) => {
                self.running = false;
                return default.unwrap_or("").to_string();
            }
            Ok(_) => {}
        }
        let input = input.trim();
        if input.is_empty() {
            default.unwrap_or("").to_string()
        } else {
            input.to_string()
        }
    }

    fn get_parsed<T: FromStr>(&mut self, prompt: &str, default: Option<&str>) -> Option<T> {
        while self.running {
            let input = self.get_input(prompt, default);
            if let Ok(value) = input.parse::<T>() {
                return Some(value);
            }
            println!("Could not understand '{}'", input);
        }
        None
    }

    fn get_date(&mut self, prompt: &str, default: NaiveDate) -> Option<NaiveDate> {
        let default = default.to_string();
        while self.running {
            let input = self.get_input(prompt, Some(&default));
            match NaiveDate::parse_from_str(&input, "%Y-%m-%d") {
                Ok(date) => return Some(date),
                Err(_) => println!("Please enter a date as YYYY-MM-DD"),
            }
        }
        None
    }

    /// Let the user pick one entry by number. `None` when the list is empty
    /// or the user backs out with 0.
    fn choose<T>(&mut self, title: &str, items: &[T], label: impl Fn(&T) -> String) -> Option<usize> {
        if items.is_empty() {
            println!("\nNothing to choose from");
            return None;
        }
        println!("\n{}:", title);
        for (i, item) in items.iter().enumerate() {
            println!("  {}. {}", i + 1, label(item));
        }
        let choice: usize = self.get_parsed("Select (0 to go back)", Some("1"))?;
        if choice == 0 || choice > items.len() {
            return None;
        }
        Some(choice - 1)
    }

    fn register_donor(&mut self) {
        println!("\n--- Register Donor ---");
        let name = self.get_input("Donor name", None);
        let Some(blood_type) = self.get_parsed::<BloodType>("Blood type (e.g. O-, AB+)", Some("O+")) else {
            return;
        };
        match Donor::new(name, blood_type) {
            Ok(donor) => {
                let name = donor.name.clone();
                self.directory.add_donor(donor);
                println!("\nRegistered {} ({})", name, blood_type);
            }
            Err(e) => println!("Error registering donor: {}", e),
        }
    }

    fn add_site(&mut self) {
        println!("\n--- Add Donation Site ---");
        let name = self.get_input("Site name", Some("Central Blood Bank"));
        let location = match Location::new(name) {
            Ok(location) => location,
            Err(e) => {
                println!("Error creating site: {}", e);
                return;
            }
        };
        let location_id = self.directory.add_location(location);
        let seats: u32 = self
            .get_parsed("Seats per time slot", Some("4"))
            .unwrap_or(4);

        for time_slot in TimeSlot::ALL {
            let defined = CapacitySlot::new(location_id, time_slot, None, None, None, seats)
                .and_then(|slot| self.service.ledger().define_slot(slot));
            if let Err(e) = defined {
                println!("Error defining {} capacity: {}", time_slot, e);
            }
        }
        println!("\nSite added with {} seats in each time slot", seats);
    }

    fn stock_unit(&mut self) {
        println!("\n--- Stock Inventory Unit ---");
        let Some(blood_type) = self.get_parsed::<BloodType>("Blood type", Some("O+")) else {
            return;
        };
        let Some(component) = self.get_parsed::<ComponentKind>("Component", Some("RedCells")) else {
            return;
        };
        let quantity: u32 = self.get_parsed("Quantity", Some("1")).unwrap_or(1);
        let today = Utc::now().date_naive();
        let Some(collected) = self.get_date("Collection date", today) else {
            return;
        };

        let stocked = component
            .expiration_for(collected)
            .and_then(|expires| InventoryUnit::new(blood_type, component, quantity, expires))
            .and_then(|unit| self.service.inventory().add_unit(unit));
        match stocked {
            Ok(unit) => println!(
                "\nStocked {} {} x{}, expires {}",
                unit.blood_type,
                unit.component,
                unit.quantity,
                unit.expires_at.format("%Y-%m-%d")
            ),
            Err(e) => println!("Error stocking unit: {}", e),
        }
    }

    fn submit_demand(&mut self) {
        println!("\n--- Submit Blood Demand ---");
        let requester = self.get_input("Requesting ward", Some("Emergency Room"));
        let Some(blood_type) = self.get_parsed::<BloodType>("Recipient blood type", Some("O+")) else {
            return;
        };
        let Some(component) = self.get_parsed::<ComponentKind>("Component", Some("RedCells")) else {
            return;
        };
        let quantity: u32 = self.get_parsed("Quantity", Some("1")).unwrap_or(1);

        println!("\nPriority levels:");
        println!("  1. Routine");
        println!("  2. Urgent");
        println!("  3. Emergency");
        let (kind, priority) = match self.get_parsed::<u32>("Select priority", Some("1")) {
            Some(3) => (RequestKind::Emergency, Priority::Emergency),
            Some(2) => (RequestKind::Standard, Priority::Urgent),
            _ => (RequestKind::Standard, Priority::Routine),
        };

        let submitted = Demand::new(kind, blood_type, component, quantity, priority, requester)
            .and_then(|demand| self.service.submit_demand(demand));
        match submitted {
            Ok((demand, workflow)) => {
                println!("\nDemand {} submitted ({})", short(demand.id), demand.priority.name());
                println!("Workflow status: {}", workflow.status);
                if let Some(note) = workflow.note {
                    println!("  {}", note);
                }
            }
            Err(e) => println!("Error submitting demand: {}", e),
        }
    }

    fn request_appointment(&mut self) {
        println!("\n--- Request Appointment ---");
        let donors = self.directory.donors();
        let Some(d) = self.choose("Donors", &donors, |d| format!("{} ({})", d.name, d.blood_type)) else {
            return;
        };
        let locations = self.directory.locations();
        let Some(l) = self.choose("Sites", &locations, |l| l.name.clone()) else {
            return;
        };
        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        let Some(date) = self.get_date("Date", tomorrow) else {
            return;
        };
        let Some(time_slot) = self.get_parsed::<TimeSlot>("Time slot (Morning/Afternoon/Evening)", Some("Morning")) else {
            return;
        };

        match self.service.appointments().create_donor_initiated(
            donors[d].id,
            locations[l].id,
            date,
            time_slot,
        ) {
            Ok(request) => println!(
                "\nRequest {} is pending review, expires {}",
                short(request.id),
                request.expires_at.format("%Y-%m-%d %H:%M")
            ),
            Err(e) => println!("Error requesting appointment: {}", e),
        }
    }

    fn review_appointments(&mut self) {
        let queue = self.service.appointments().review_queue(None);
        if queue.is_empty() {
            println!("\nNo pending requests to review");
            return;
        }

        println!("\n--- Reviewing {} requests ---", queue.len());
        let approve_all = self.get_input("Approve all in queue order? (y/n)", Some("y"));
        let decision = if approve_all.eq_ignore_ascii_case("y") {
            StaffDecision::Approve
        } else {
            StaffDecision::Reject
        };
        let batch = self.service.appointments().review_pending(None, |_| decision);

        println!("\n--- Review Results ---");
        println!("  Total requests: {}", batch.total);
        println!("  Processed: {}", batch.processed.len());
        println!("  Failed: {}", batch.failed.len());
        println!("  Success rate: {:.1}%", batch.success_rate());
        for failure in &batch.failed {
            println!("  - {}: {}", short(failure.request.id), failure.error);
        }
    }

    fn view_inventory(&self) {
        let now = Utc::now();
        let levels = self.service.inventory().stock_levels(now);
        if levels.is_empty() {
            println!("\nNo available stock");
        } else {
            println!("\n--- Available Stock ---");
            for ((blood_type, component), level) in &levels {
                println!(
                    "  {:4} {:10} units: {:3}  quantity: {}",
                    blood_type.to_string(),
                    component.to_string(),
                    level.units,
                    level.quantity
                );
            }
        }

        let page = self.service.inventory().list(
            &UnitFilter {
                status: Some(InventoryStatus::Available),
                ..UnitFilter::default()
            },
            UnitSort::ExpiresAt,
            SortDirection::Ascending,
            PageRequest::first(10),
        );
        if !page.items.is_empty() {
            println!("\nExpiring soonest:");
            for unit in &page.items {
                println!(
                    "  {} {} {} x{} expires {}",
                    short(unit.id),
                    unit.blood_type,
                    unit.component,
                    unit.quantity,
                    unit.expires_at.format("%Y-%m-%d")
                );
            }
            if page.has_more() {
                println!("  ... and {} more", page.total - page.items.len());
            }
        }
    }

    fn view_capacity(&mut self) {
        let locations = self.directory.locations();
        let Some(l) = self.choose("Sites", &locations, |l| l.name.clone()) else {
            return;
        };
        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        let Some(date) = self.get_date("Date", tomorrow) else {
            return;
        };

        println!("\n{} on {}:", locations[l].name, date.format("%A, %Y-%m-%d"));
        for (time_slot, open) in self.service.ledger().available_capacity(locations[l].id, date) {
            let (start, end) = time_slot.hours();
            println!(
                "  {:9} {}-{}  open: {}",
                time_slot.to_string(),
                start.format("%H:%M"),
                end.format("%H:%M"),
                open
            );
        }
    }

    fn run_sweep(&self) {
        let report = self.service.sweep(Utc::now());
        println!("\nExpired units: {}", report.expired_units.len());
        println!("Expired requests: {}", report.expired_requests.len());
    }

    fn run_demo(&self) {
        println!("\n--- Running Demo ---");
        if let Err(e) = self.demo() {
            println!("Demo stopped: {}", e);
        }
    }

    fn demo(&self) -> donorflow::Result<()> {
        let site = self.directory.add_location(Location::new("Demo Blood Bank")?);
        self.service
            .ledger()
            .define_slot(CapacitySlot::new(site, TimeSlot::Morning, None, None, None, 2)?)?;
        println!("Demo Blood Bank opens 2 morning seats per day");

        let today = Utc::now().date_naive();
        let inventory = self.service.inventory();
        inventory.add_unit(InventoryUnit::new(
            BloodType::OPos,
            ComponentKind::RedCells,
            2,
            Utc::now() + Duration::days(5),
        )?)?;
        inventory.add_unit(InventoryUnit::new(
            BloodType::ONeg,
            ComponentKind::RedCells,
            2,
            Utc::now() + Duration::days(30),
        )?)?;
        println!("Stocked O+ red cells (5 days left) and O- red cells (30 days left)");

        let (_, workflow) = self.service.submit_demand(
            Demand::new(
                RequestKind::Standard,
                BloodType::OPos,
                ComponentKind::RedCells,
                2,
                Priority::Routine,
                "Surgery",
            )?
            .with_deadline(Utc::now() + Duration::days(2)),
        )?;
        println!("\nO+ red cell demand -> {}", workflow.status);
        if let Some(note) = &workflow.note {
            println!("  {}", note);
        }

        let (_, platelets) = self.service.submit_demand(Demand::new(
            RequestKind::Emergency,
            BloodType::AbNeg,
            ComponentKind::Platelets,
            1,
            Priority::Emergency,
            "Oncology",
        )?)?;
        println!("AB- platelet demand -> {} (nothing in stock)", platelets.status);

        let date = today + Duration::days(2);
        let donors = [
            ("Ada", BloodType::ANeg),
            ("Grace", BloodType::AbNeg),
            ("Alan", BloodType::OPos),
        ];
        let mut donor_ids: Vec<Uuid> = Vec::new();
        println!("\nDonors request the morning of {}:", date);
        for (name, blood_type) in donors {
            let donor_id = self.directory.add_donor(Donor::new(name, blood_type)?);
            donor_ids.push(donor_id);
            match self
                .service
                .appointments()
                .create_donor_initiated(donor_id, site, date, TimeSlot::Morning)
            {
                Ok(_) => println!("  - {:6} ({}) pending", name, blood_type),
                Err(e) => println!("  - {:6} ({}) refused: {}", name, blood_type, e),
            }
        }

        if let Some(request) = self.service.appointments().outstanding_for(donor_ids[1]) {
            self.service.appointments().prioritize(request.id, true, 1)?;
            println!("Grace's request marked urgent: her type matches the platelet demand");
        }

        let batch = self
            .service
            .appointments()
            .review_pending(Some(site), |_| StaffDecision::Approve);
        println!("\nReview order:");
        for request in &batch.processed {
            let name = self
                .directory
                .donors()
                .into_iter()
                .find(|d| d.id == request.donor_id)
                .map_or_else(|| short(request.donor_id), |d| d.name);
            println!("  {:6} -> {}", name, request.status);
        }

        if let Some(request) = self.service.appointments().outstanding_for(donor_ids[1]) {
            self.service.link_appointment(request.id, platelets.id)?;
            let (_, workflow, unit) = self.service.complete_appointment(request.id, date, 1)?;
            println!(
                "\nGrace donated: workflow {}, new {} {} unit expires {}",
                workflow.status,
                unit.blood_type,
                unit.component,
                unit.expires_at.format("%Y-%m-%d")
            );
        }

        let open = self.service.ledger().available_capacity(site, date);
        println!("\nMorning seats still open on {}: {}", date, open[&TimeSlot::Morning]);
        Ok(())
    }

    fn run(&mut self) {
        self.print_header();

        while self.running {
            self.print_menu();

            let Some(choice) = self.get_parsed::<u32>("Enter choice", Some("10")) else {
                break;
            };

            match choice {
                1 => self.register_donor(),
                2 => self.add_site(),
                3 => self.stock_unit(),
                4 => self.submit_demand(),
                5 => self.request_appointment(),
                6 => self.review_appointments(),
                7 => self.view_inventory(),
                8 => self.view_capacity(),
                9 => self.run_sweep(),
                10 => self.run_demo(),
                11 => {
                    self.running = false;
                    println!("\nGoodbye!");
                }
                _ => println!("Invalid choice"),
            }
        }
    }
}

fn short(id: Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("donorflow={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.level);
    info!(
        default_slot_capacity = config.scheduling.default_slot_capacity,
        auto_match = config.inventory.auto_match_on_create,
        "donorflow starting"
    );

    let mut cli = DonorFlowCli::new(config);
    cli.run();
    ExitCode::SUCCESS
}
