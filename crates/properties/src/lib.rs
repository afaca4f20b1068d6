//! Property domain module: normalized property, owner and loan records plus
//! do-not-mail suppression entries.
//!
//! Pure data and validation (no IO, no storage).

pub mod dnm;
pub mod property;

pub use dnm::{DnmEntry, NewDnmEntry};
pub use property::{
    Address, Loan, LoanPosition, Property, PropertyBundle, PropertyOwner, RadarId,
};
