use serde::{Deserialize, Serialize};


/// Why the run loop stopped without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Halt,
    Shutdown,
}


/// Summary of one run loop, returned on normal termination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub stop: StopReason,
    /// Total exits handled, including the terminal one.
    pub exits: u64,
    pub io_in: u64,
    pub io_out: u64,
    pub debug: u64,
    /// Unknown exits tolerated under `LogAndContinue`.
    pub ignored_unknown: u64,
    /// Instruction pointer read after the loop stopped, when available.
    pub final_rip: Option<u64>,
}


impl RunReport {
    pub(crate) fn new(stop: StopReason) -> Self {
        Self { stop, exits: 0, io_in: 0, io_out: 0, debug: 0, ignored_unknown: 0, final_rip: None }
    }
}
