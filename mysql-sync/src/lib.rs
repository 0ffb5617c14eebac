//! Per-node daemon replicating row-level MySQL changes to peers over an
//! MQTT bus.
//!
//! Five components wired exclusively through the [`hub::EventHub`]:
//!
//! - [`db`] — Database Gateway (B): trigger setup, change-log polling,
//!   row apply, `sync_status` maintenance.
//! - [`bus`] — Bus Gateway (C): connect/subscribe/publish, presence,
//!   per-peer offline queues.
//! - [`transform`] — Transformer Stage (D): per-table entity rewriting.
//! - [`hub`] — Event Hub (E): the named async event bus.
//! - [`queue`] — Durable Queue (A): the file-backed primitive A–D share.

pub mod bus;
pub mod db;
pub mod hub;
pub mod queue;
pub mod transform;
pub mod util;
