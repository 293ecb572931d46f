//! Golem - voice-assisted animatronic control core
//!
//! Library surface of the robot daemon: configuration, the dialogue
//! state machine, conversation memory, the status-indicator seam and
//! the startup dependency checks. The hardware and pipeline layers live
//! in the workspace crates (`golem-servo`, `golem-audio`,
//! `golem-vision`, `golem-services`); this crate glues them together.

#![forbid(unsafe_code)]

pub mod config;
pub mod dialogue;
pub mod indicator;
pub mod memory;
pub mod startup;
