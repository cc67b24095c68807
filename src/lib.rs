// ABOUTME: Library module for pg-table-migrator
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod commands;
pub mod config;
pub mod destination;
pub mod migrator;
pub mod postgres;
pub mod record;
pub mod report;
pub mod source;
pub mod strategy;
pub mod tables;
pub mod utils;
pub mod verify;
