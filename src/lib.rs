//! Single-owner "room" ledgers deployed by a factory on a simulated chain.
//!
//! * [`room`] — the room state machine: deposits, replay-protected rewards,
//!   pause/activation gates, refunds and destruction.
//! * [`factory`] — deploys rooms at deterministic addresses.
//! * [`chain`] — the in-process host that serializes transactions, moves
//!   native value and keeps the event log.
//! * [`script`] and [`simulation`] — scripted and randomized drivers used by
//!   the `room-ledger` binary.

pub mod address;
pub mod chain;
pub mod config;
pub mod factory;
pub mod room;
pub mod script;
pub mod simulation;

pub use address::{Address, Amount, RewardId, UNIT};
pub use chain::{Chain, ChainError, Receipt, SharedChain, Transaction};
pub use room::{CallContext, RoomCall, RoomError, RoomEvent, RoomLedger};
