//! Scenario and property suites
//!
//! Unit tests live next to the code they cover; these suites drive whole
//! designs through the simulator.

#[cfg(test)]
mod support;
#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod concurrency_tests;
