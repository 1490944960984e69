//! Plain linear-probe reference variant, kept as the differential-testing
//! oracle for the production split table.

pub mod table;

pub use table::PlainIndexTable;
