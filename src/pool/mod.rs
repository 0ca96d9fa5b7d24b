//! Arena for request records.

pub mod record_slab;

pub use record_slab::{RecordCells, RecordId, RecordSlab, SLAB_CAPACITY_MAX};
