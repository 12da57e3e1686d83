pub mod migrate;
pub mod reconcile;
pub mod serve;
pub mod status;
