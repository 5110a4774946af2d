/// Blood-type compatibility lookup.
///
/// Fixed, process-wide tables keyed by recipient type. Each table lists the
/// donor types a recipient may receive for one component, preferred donors
/// first. Red cells and whole blood follow donor-antigen rules, plasma
/// follows donor-antibody rules, and platelets prefer ABO-identical donors
/// while keeping Rh-negative recipients on Rh-negative product.

use std::str::FromStr;

use crate::error::{EntityKind, FulfillmentError, Result};
use crate::models::{BloodType, ComponentKind};

use BloodType::{ANeg, APos, AbNeg, AbPos, BNeg, BPos, ONeg, OPos};

static RED_CELLS: [&[BloodType]; 8] = [
    /* O- */ &[ONeg],
    /* O+ */ &[ONeg, OPos],
    /* A- */ &[ONeg, ANeg],
    /* A+ */ &[ONeg, OPos, ANeg, APos],
    /* B- */ &[ONeg, BNeg],
    /* B+ */ &[ONeg, OPos, BNeg, BPos],
    /* AB- */ &[ONeg, ANeg, BNeg, AbNeg],
    /* AB+ */ &[ONeg, OPos, ANeg, APos, BNeg, BPos, AbNeg, AbPos],
];

static PLASMA: [&[BloodType]; 8] = [
    /* O- */ &[ONeg, OPos, ANeg, APos, BNeg, BPos, AbNeg, AbPos],
    /* O+ */ &[OPos, ONeg, APos, ANeg, BPos, BNeg, AbPos, AbNeg],
    /* A- */ &[ANeg, APos, AbNeg, AbPos],
    /* A+ */ &[APos, ANeg, AbPos, AbNeg],
    /* B- */ &[BNeg, BPos, AbNeg, AbPos],
    /* B+ */ &[BPos, BNeg, AbPos, AbNeg],
    /* AB- */ &[AbNeg, AbPos],
    /* AB+ */ &[AbPos, AbNeg],
];

static PLATELETS: [&[BloodType]; 8] = [
    /* O- */ &[ONeg, ANeg, BNeg, AbNeg],
    /* O+ */ &[OPos, ONeg, APos, ANeg, BPos, BNeg, AbPos, AbNeg],
    /* A- */ &[ANeg, AbNeg, ONeg],
    /* A+ */ &[APos, ANeg, AbPos, AbNeg, OPos, ONeg],
    /* B- */ &[BNeg, AbNeg, ONeg],
    /* B+ */ &[BPos, BNeg, AbPos, AbNeg, OPos, ONeg],
    /* AB- */ &[AbNeg, ANeg, BNeg, ONeg],
    /* AB+ */ &[AbPos, AbNeg, APos, ANeg, BPos, BNeg, OPos, ONeg],
];

fn row(recipient: BloodType) -> usize {
    match recipient {
        ONeg => 0,
        OPos => 1,
        ANeg => 2,
        APos => 3,
        BNeg => 4,
        BPos => 5,
        AbNeg => 6,
        AbPos => 7,
    }
}

/// Donor types a recipient may receive for a component, preferred first.
pub fn compatible_donor_types(recipient: BloodType, component: ComponentKind) -> &'static [BloodType] {
    let table = match component {
        ComponentKind::WholeBlood | ComponentKind::RedCells => &RED_CELLS,
        ComponentKind::Plasma => &PLASMA,
        ComponentKind::Platelets => &PLATELETS,
    };
    table[row(recipient)]
}

/// String-boundary lookup.
///
/// An unknown recipient type is `NotFound`; an unknown component name falls
/// back to the whole-blood table.
pub fn compatible_donor_types_by_name(
    recipient: &str,
    component: &str,
) -> Result<&'static [BloodType]> {
    let recipient = BloodType::from_str(recipient.trim())
        .map_err(|_| FulfillmentError::not_found(EntityKind::BloodType, recipient))?;
    let component = ComponentKind::from_str(component.trim()).unwrap_or(ComponentKind::WholeBlood);
    Ok(compatible_donor_types(recipient, component))
}

pub fn is_compatible(donor: BloodType, recipient: BloodType, component: ComponentKind) -> bool {
    compatible_donor_types(recipient, component).contains(&donor)
}
