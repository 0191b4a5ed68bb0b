// tandem-common: shared domain types and wire protocol for the Tandem workspace

pub mod error;
pub mod protocol;
pub mod types;
