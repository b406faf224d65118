//! Shared types for the recorder: configuration and the segment
//! file-name / calendar codec.

pub mod config;
pub mod segment;
