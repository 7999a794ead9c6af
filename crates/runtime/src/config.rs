//! Runtime configuration.
//!
//! Generalizes the source's `DEBUG_PRINT_CODE` / `DEBUG_TRACE_EXECUTION` /
//! `DEBUG_STRESS_GC` / `DEBUG_LOG_GC` compile-time toggles into a plain
//! struct threaded through construction, so a single compiled binary can
//! serve both modes (spec §1, SPEC_FULL §4.6).

#[derive(Debug, Clone)]
pub struct Config {
    /// `next_gc` grows by this factor after each collection.
    pub gc_grow_factor: f64,
    /// `bytes_allocated` threshold that triggers the first collection.
    pub gc_initial_threshold_bytes: usize,
    /// Frame stack depth that raises "Stack overflow.".
    pub frame_capacity: usize,
    /// Initial value-stack reservation.
    pub stack_capacity: usize,
    /// Print each instruction before it executes.
    pub trace_execution: bool,
    /// Print a line before and after each collection cycle.
    pub trace_gc: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gc_grow_factor: 2.0,
            gc_initial_threshold_bytes: 1024 * 1024,
            frame_capacity: 64,
            stack_capacity: 16 * 1024,
            trace_execution: false,
            trace_gc: false,
        }
    }
}
