//! Property harnesses for the vring rings and buffer lifecycle.
//!
//! `ring_model` drives a real [`IndexRing`](vring_primitives::IndexRing) over
//! heap memory against a `VecDeque`. `fanout_model` drives a live topic in
//! POSIX shared memory against a per-reader queue model and checks the
//! descriptor accounting after every step.

pub mod fanout_model;
pub mod ring_model;
