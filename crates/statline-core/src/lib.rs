// Library root: the pure and file-backed half of statline. Formulas,
// constants, stabilization and the quality gate live here; the database and
// the batch job live in statline-app.

pub mod config;
pub mod constants;
pub mod estimate;
pub mod formulas;
pub mod normalize;
pub mod park;
pub mod quality;
pub mod sampling;
pub mod shrink;
pub mod stats;
pub mod team;
pub mod tolerance;
