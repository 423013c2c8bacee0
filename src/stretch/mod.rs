//! Stretch planning: sizing rules and the output-hop calculator.

pub mod calculator;
pub mod sizes;
