//! Chatstate: relational persistence for chat bot state.

pub mod codec;
pub mod config;
pub mod error;
pub mod migrate;
pub mod persistence;
pub mod store;
