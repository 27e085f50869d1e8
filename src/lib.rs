//! gridsweep - queue-backed distributed parameter sweep workers.
//!
//! A batch of independent numeric parameters is split into chunks, seeded
//! into a shared queue, and drained by any number of stateless worker
//! processes. Two queue backends are supported behind one abstraction:
//! Redis Streams with consumer groups, and an AMQP broker with retry and
//! dead-letter queues.

pub mod cli;
pub mod compute;
pub mod config;
pub mod models;
pub mod queue;
pub mod worker;
