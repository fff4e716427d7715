//! A lock-free concurrency library for Rust.
//!
//! This crate provides linked multi-producer multi-consumer collections, a FIFO
//! queue and two LIFO stacks, together with the lock-free memory management that
//! makes them safe. The hard part of a non-blocking linked structure is deciding
//! when a node can be physically freed while other threads may still hold a raw
//! reference to it. The `memory` module solves this twice, once with split
//! reference counting and once with deferred batched reclamation, and the
//! `structures` module builds the collections on top.

extern crate rand;
extern crate thread_local;

pub mod structures;
pub mod memory;
