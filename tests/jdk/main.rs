//! Ports of the JDK's `ConcurrentHashMap` test suite.

mod concurrent_associate;
mod concurrent_contains;
mod map_check;
