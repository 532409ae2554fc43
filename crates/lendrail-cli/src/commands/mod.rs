pub mod drill;
pub mod incident;
pub mod init;
pub mod reconcile;
pub mod status;
pub mod worker;
