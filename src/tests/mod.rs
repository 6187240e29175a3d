//! Scenario-style tests exercising spec §8's invariants end to end, one
//! file per subsystem, pulled in from `lib.rs` under `#[cfg(test)]` rather
//! than unit tests living only inside each module.

mod bgzf_round_trip;
mod ring_invariants;
