//! Lock-Free stack for Rust, reclaiming memory with split reference counting
//!
//! A lock-free stack has to answer one hard question: when may a popped node be freed, given
//! that other threads might have read the head pointer a moment before the pop and still be
//! about to dereference it? Without a garbage collector the node must outlive every such
//! reader, or the reader touches freed memory.
//!
//! `LockFreeStack` answers it with split reference counting. The head slot carries the top
//! node's address together with an *external* count of the references handed out through the
//! slot, and the pair is swapped as one word by compare-and-swap. Each node keeps an
//! *internal* count of the references given back. The two halves are reconciled when a node
//! is unlinked, and the node is freed by whichever thread drives the combined count to zero,
//! the popper itself or the last thread still looking at it.
//!
//! No locks are taken: `push` and `try_pop` retry their CAS until it succeeds, so some thread
//! always makes progress, though a single call may retry many times under contention.
//!
#![allow(dead_code)]

pub mod util;
pub mod error;
pub mod backoff;
pub mod counted_ptr;
pub mod lockfree_stack;

pub use lockfree_stack::LockFreeStack;

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;

extern crate portable_atomic;
