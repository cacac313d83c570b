//! Shared type definitions
//!
//! This module contains the data types shared by the engine, the queue and storage.

pub mod catalog;
pub mod config;
pub mod job;
pub mod message;
pub mod model;
