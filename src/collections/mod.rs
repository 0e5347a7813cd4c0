//! Bounded, I/O-free queue primitives used by the crawl worker.

pub mod ring;
pub mod heap;

pub use ring::BoundedQueue;
pub use heap::BoundedPriorityQueue;
