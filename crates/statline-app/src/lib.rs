// Library root: the database-backed half of statline. Re-exports every module
// so the binary and the integration tests share one API.

pub mod db;
pub mod import;
pub mod invariants;
pub mod recompute;
pub mod source;
