// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Journal contract: write hooks on the delivering thread, batch-boundary
//! flushes and the replay gate that holds live delivery back.

use std::{
	sync::{
		Arc, Mutex,
		atomic::{AtomicUsize, Ordering},
	},
	thread,
	time::Duration,
};

use axon_core::{Address, Journal, Message, NullJournal, Reply, Result};
use axon_core::journal::ReplaySink;
use axon_runtime::{Actor, ActorConfig, ActorRef, Context, PoolConfig, ThreadPool};
use serde_json::{Value, json};

fn test_pool() -> ThreadPool {
	let pool = ThreadPool::new(PoolConfig {
		thread_max: 4,
		idle_min: 1,
		idle_max: 4,
		idle_timeout: Duration::from_millis(200),
		..Default::default()
	})
	.unwrap();
	pool.start();
	pool
}

fn wait_for(check: impl Fn() -> bool, what: &str) {
	for _ in 0..1000 {
		if check() {
			return;
		}
		thread::sleep(Duration::from_millis(2));
	}
	panic!("timed out waiting for {}", what);
}

/// Journal that replays two queries and defers its completion until the
/// test releases it, recording every write and flush it sees.
struct GatedJournal {
	address: Address,
	done: Mutex<Option<Reply>>,
	writes: Mutex<Vec<String>>,
	flushes: AtomicUsize,
}

impl Journal for GatedJournal {
	fn write_send(&self, _target: &Address, method: &str, _args: &[Value]) {
		self.writes.lock().unwrap().push(format!("send:{}", method));
	}

	fn write_query(&self, _target: &Address, method: &str, _args: &[Value]) {
		self.writes.lock().unwrap().push(format!("query:{}", method));
	}

	fn flush(&self) {
		self.flushes.fetch_add(1, Ordering::SeqCst);
	}

	fn replay_start(&self, done: Reply, replay: &mut ReplaySink<'_>) {
		replay(Message::replay_query(self.address.clone(), "replay-1", vec![])).unwrap();
		replay(Message::replay_query(self.address.clone(), "replay-2", vec![])).unwrap();
		*self.done.lock().unwrap() = Some(done);
	}
}

/// Records handled method names in delivery order.
struct MethodLog {
	seen: Arc<Mutex<Vec<String>>>,
}

impl Actor for MethodLog {
	fn handle(&mut self, message: Message, _ctx: &mut Context<'_>) -> Result<()> {
		match message {
			Message::Send {
				method, ..
			}
			| Message::ReplayQuery {
				method, ..
			} => self.seen.lock().unwrap().push(method),
			_ => {}
		}
		Ok(())
	}
}

#[test]
fn test_replay_gates_live_delivery() {
	let pool = test_pool();
	let address = Address::new("/journaled");
	let journal = Arc::new(GatedJournal {
		address: address.clone(),
		done: Mutex::new(None),
		writes: Mutex::new(Vec::new()),
		flushes: AtomicUsize::new(0),
	});
	let seen = Arc::new(Mutex::new(Vec::new()));

	let actor = ActorRef::launch(
		address,
		MethodLog {
			seen: Arc::clone(&seen),
		},
		&pool,
		Arc::clone(&journal) as Arc<dyn Journal>,
		&ActorConfig::default(),
	)
	.unwrap();

	// live traffic arrives while the journal still replays
	actor.send("live-1", vec![]).unwrap();
	actor.send("live-2", vec![]).unwrap();

	thread::sleep(Duration::from_millis(50));
	assert!(seen.lock().unwrap().is_empty(), "nothing may be delivered before replay completes");

	// release the replay gate
	journal.done.lock().unwrap().take().expect("replay_start ran").ok(json!(true));

	wait_for(|| seen.lock().unwrap().len() == 4, "replayed and live messages delivered");

	assert_eq!(
		*seen.lock().unwrap(),
		vec!["replay-1", "replay-2", "live-1", "live-2"],
		"replayed messages must precede live delivery"
	);

	// replayed queries are not re-journaled; the live sends are
	assert_eq!(*journal.writes.lock().unwrap(), vec!["send:live-1", "send:live-2"]);

	assert!(journal.flushes.load(Ordering::SeqCst) >= 1, "flush must run at batch boundaries");

	pool.close();
}

#[test]
fn test_null_journal_releases_immediately() {
	let pool = test_pool();
	let seen = Arc::new(Mutex::new(Vec::new()));

	let actor = ActorRef::launch(
		"/unjournaled",
		MethodLog {
			seen: Arc::clone(&seen),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig::default(),
	)
	.unwrap();

	actor.send("immediate", vec![]).unwrap();
	wait_for(|| seen.lock().unwrap().len() == 1, "delivery with the null journal");

	pool.close();
}

#[test]
fn test_replayed_query_reply_is_silent() {
	// a replayed query carries a no-op continuation: completing it must
	// not do anything observable
	let message = Message::replay_query("/anywhere", "noop", vec![]);
	let reply = message.reply().unwrap();
	reply.ok(json!(1));
	reply.fail(axon_core::Error::QueueClosed);
	assert!(reply.is_complete());
}
