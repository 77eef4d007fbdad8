//! Motion core for the Cinder CNC controller.
//!
//! Data flows one way through this crate: a groomed text line enters the
//! [`gcode`] parser, becomes a block in the [`planner`] ring, is sliced
//! into constant-rate segments by the [`segment`] preparer, and leaves as
//! pulse bytes from the [`stepgen`] step generator. Control flows both
//! ways through the system state machine in `cinder_common`.
//!
//! - [`gcode`] - line parser and modal-state interpreter
//! - [`planner`] - block ring with look-ahead junction-speed optimization
//! - [`segment`] - segment ring and velocity-profile preparer
//! - [`stepgen`] - hard real-time Bresenham step pulse generator
//! - [`control`] - line/arc/dwell motion primitives
//! - [`pipeline`] - startup wiring of the above into running tasks
//!
//! The step generator's fast path performs no heap allocation; everything
//! it touches is pre-allocated at startup.

pub mod control;
pub mod gcode;
pub mod pipeline;
pub mod planner;
pub mod segment;
pub mod stepgen;
