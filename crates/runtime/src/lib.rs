// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Actor scheduling core.
//!
//! Every actor owns a bounded delivery queue ([`RingQueue`]) drained by a
//! [`Worker`] whose state machine guarantees that at most one backing
//! thread executes the delivery loop at a time. Backing threads come from
//! a shared, dynamically sized [`ThreadPool`] whose launcher bounds pool
//! growth and throttles thread-creation storms. Messages emitted while a
//! handler runs accumulate in an [`Outbox`] and are flushed at batch end.

mod actor;
mod blocker;
mod config;
mod outbox;
mod pool;
mod ring;
mod worker;

pub use actor::{Actor, ActorDeliver, ActorRef, Context, Envelope, Mailbox};
pub use axon_core::{Error, Result};
pub use blocker::{CondvarBlocker, NullBlocker, RingBlocker};
pub use config::{ActorConfig, PoolConfig, QueueConfig, WorkerConfig};
pub use outbox::{FlushOutcome, MessageDeliver, Outbox, RunOne};
pub use pool::{PoolTask, ThreadPool};
pub use ring::{OfferError, RingQueue, ShutdownMode};
pub use worker::{Deliver, State, Worker, WorkerState};
