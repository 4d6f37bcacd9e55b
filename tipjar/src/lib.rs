//! Payment primitives for the tipjar donations platform.
//!
//! Pure, I/O-free building blocks consumed by the `tipjard` payments daemon:
//! BIP84 receive address derivation, donation input validation and payment
//! URI construction.

pub mod derive;
pub mod payment_uri;
pub mod validation;

pub use bitcoin;

pub use derive::{DeriveError, MasterKey};
pub use validation::{DonorInfo, ValidationError};
