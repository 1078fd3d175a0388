//! Minibox CLI - minimal container runtime.

pub mod commands;
