// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! End-to-end delivery through actors, workers and the backing pool.

use std::{
	sync::{Arc, Mutex, mpsc},
	time::Duration,
};

use axon_core::{Error, Message, NullJournal, Reply, Result};
use axon_runtime::{
	Actor, ActorConfig, ActorRef, Context, PoolConfig, QueueConfig, ShutdownMode, ThreadPool, WorkerConfig,
};
use serde_json::{Value, json};

fn test_pool() -> ThreadPool {
	let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();

	let pool = ThreadPool::new(PoolConfig {
		thread_max: 8,
		idle_min: 2,
		idle_max: 8,
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
		std::thread::sleep(Duration::from_millis(2));
	}
	panic!("timed out waiting for {}", what);
}

/// Records the numeric first argument of every send, in delivery order.
struct Sequencer {
	seen: Arc<Mutex<Vec<u64>>>,
}

impl Actor for Sequencer {
	fn handle(&mut self, message: Message, _ctx: &mut Context<'_>) -> Result<()> {
		if let Message::Send {
			args, ..
		} = message
		{
			self.seen.lock().unwrap().push(args[0].as_u64().unwrap());
		}
		Ok(())
	}
}

#[test]
fn test_single_producer_delivery_order() {
	let pool = test_pool();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let actor = ActorRef::launch(
		"/sequencer",
		Sequencer {
			seen: Arc::clone(&seen),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig::default(),
	)
	.unwrap();

	let total = 500u64;
	for i in 0..total {
		actor.send("push", vec![json!(i)]).unwrap();
	}

	wait_for(|| seen.lock().unwrap().len() == total as usize, "all sends delivered");

	let seen = seen.lock().unwrap();
	assert_eq!(*seen, (0..total).collect::<Vec<_>>(), "offer order must be delivery order");

	pool.close();
}

/// Forwards every send to a downstream actor through the outbox.
struct Forwarder {
	downstream: ActorRef,
}

impl Actor for Forwarder {
	fn handle(&mut self, message: Message, ctx: &mut Context<'_>) -> Result<()> {
		if let Message::Send {
			method,
			args,
			..
		} = message
		{
			let forwarded = Message::send(self.downstream.address().clone(), method, args);
			ctx.send(&self.downstream, forwarded);
		}
		Ok(())
	}
}

#[test]
fn test_outbox_forwarding_preserves_order() {
	let pool = test_pool();
	let seen = Arc::new(Mutex::new(Vec::new()));

	let sink = ActorRef::launch(
		"/sink",
		Sequencer {
			seen: Arc::clone(&seen),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig::default(),
	)
	.unwrap();

	let forwarder = ActorRef::launch(
		"/forwarder",
		Forwarder {
			downstream: sink.clone(),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig::default(),
	)
	.unwrap();

	let total = 200u64;
	for i in 0..total {
		forwarder.send("relay", vec![json!(i)]).unwrap();
	}

	wait_for(|| seen.lock().unwrap().len() == total as usize, "forwarded messages");
	assert_eq!(*seen.lock().unwrap(), (0..total).collect::<Vec<_>>());

	pool.close();
}

/// Echoes queries: the trace header when present, the method name
/// otherwise. Fails queries for the method "reject".
struct Responder;

impl Actor for Responder {
	fn handle(&mut self, message: Message, _ctx: &mut Context<'_>) -> Result<()> {
		if let Message::Query {
			method,
			headers,
			reply,
			..
		} = message
		{
			if method == "reject" {
				return Err(Error::Config("rejected by handler".to_string()));
			}

			match headers.get("trace") {
				Some(trace) => reply.ok(trace.clone()),
				None => reply.ok(json!(method)),
			}
		}
		Ok(())
	}
}

#[test]
fn test_headers_propagate_to_handler() {
	let pool = test_pool();
	let actor = ActorRef::launch("/responder", Responder, &pool, Arc::new(NullJournal), &ActorConfig::default())
		.unwrap();

	let (tx, rx) = mpsc::channel();
	let reply = Reply::new(move |result| tx.send(result).unwrap());

	let mut message = Message::query(actor.address().clone(), "echo", vec![], reply);
	message.headers_mut().unwrap().set("trace", json!("t-42"));
	actor.offer(message).unwrap();

	let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
	assert_eq!(result.unwrap(), json!("t-42"));

	pool.close();
}

#[test]
fn test_handler_error_fails_query_reply() {
	let pool = test_pool();
	let actor = ActorRef::launch("/rejecting", Responder, &pool, Arc::new(NullJournal), &ActorConfig::default())
		.unwrap();

	let (tx, rx) = mpsc::channel();
	let reply = Reply::new(move |result| tx.send(result).unwrap());
	actor.query("reject", vec![], reply).unwrap();

	match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
		Err(Error::Config(detail)) => assert!(detail.contains("rejected")),
		other => panic!("expected the handler error, got {:?}", other),
	}

	pool.close();
}

/// Holds each message long enough for a small ring to fill up.
struct SlowDrain {
	seen: Arc<Mutex<Vec<u64>>>,
	delay: Duration,
}

impl Actor for SlowDrain {
	fn handle(&mut self, message: Message, _ctx: &mut Context<'_>) -> Result<()> {
		if let Message::Send {
			args, ..
		} = message
		{
			std::thread::sleep(self.delay);
			self.seen.lock().unwrap().push(args[0].as_u64().unwrap());
		}
		Ok(())
	}
}

#[test]
fn test_blocking_offer_rides_out_a_full_ring() {
	let pool = test_pool();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let actor = ActorRef::launch(
		"/slow-blocking",
		SlowDrain {
			seen: Arc::clone(&seen),
			delay: Duration::from_millis(2),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig {
			queue: QueueConfig {
				capacity: 4,
				blocking: true,
			},
			worker: WorkerConfig::default(),
		},
	)
	.unwrap();

	let total = 32u64;
	for i in 0..total {
		actor.offer_wait(Message::send(actor.address().clone(), "push", vec![json!(i)]), Some(Duration::from_secs(10)))
			.unwrap();
	}

	wait_for(|| seen.lock().unwrap().len() == total as usize, "all blocked offers delivered");
	assert_eq!(*seen.lock().unwrap(), (0..total).collect::<Vec<_>>());

	pool.close();
}

#[test]
fn test_nonblocking_offer_reports_full() {
	let pool = test_pool();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let actor = ActorRef::launch(
		"/slow-nonblocking",
		SlowDrain {
			seen: Arc::clone(&seen),
			delay: Duration::from_millis(100),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig {
			queue: QueueConfig {
				capacity: 4,
				blocking: false,
			},
			worker: WorkerConfig::default(),
		},
	)
	.unwrap();

	// first message occupies the handler, the next ones fill the ring
	actor.send("push", vec![json!(0)]).unwrap();
	std::thread::sleep(Duration::from_millis(20));

	let mut full = 0;
	for i in 1..8u64 {
		if matches!(actor.send("push", vec![json!(i)]), Err(Error::QueueFull)) {
			full += 1;
		}
	}

	assert!(full >= 1, "a capacity-4 ring under a slow handler must refuse some offers");

	pool.close();
}

#[test]
fn test_graceful_shutdown_drains_queued_messages() {
	let pool = test_pool();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let actor = ActorRef::launch(
		"/draining",
		SlowDrain {
			seen: Arc::clone(&seen),
			delay: Duration::from_millis(1),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig::default(),
	)
	.unwrap();

	for i in 0..50u64 {
		actor.send("push", vec![json!(i)]).unwrap();
	}

	actor.shutdown(ShutdownMode::Graceful);

	assert_eq!(seen.lock().unwrap().len(), 50, "graceful shutdown must deliver what was queued");
	assert!(matches!(actor.send("late", vec![json!(0)]), Err(Error::QueueClosed)));

	pool.close();
}

#[test]
fn test_stream_variants_reach_handler() {
	struct StreamSink {
		values: Arc<Mutex<Vec<Value>>>,
		completed: Arc<Mutex<bool>>,
	}

	impl Actor for StreamSink {
		fn handle(&mut self, message: Message, _ctx: &mut Context<'_>) -> Result<()> {
			match message {
				Message::StreamUpdate {
					value, ..
				} => self.values.lock().unwrap().push(value),
				Message::StreamComplete { .. } => *self.completed.lock().unwrap() = true,
				_ => {}
			}
			Ok(())
		}
	}

	let pool = test_pool();
	let values = Arc::new(Mutex::new(Vec::new()));
	let completed = Arc::new(Mutex::new(false));
	let actor = ActorRef::launch(
		"/stream-sink",
		StreamSink {
			values: Arc::clone(&values),
			completed: Arc::clone(&completed),
		},
		&pool,
		Arc::new(NullJournal),
		&ActorConfig::default(),
	)
	.unwrap();

	for sequence in 0..3u64 {
		actor.offer(Message::StreamUpdate {
			target: actor.address().clone(),
			sequence,
			value: json!(sequence * 10),
			headers: Default::default(),
		})
		.unwrap();
	}
	actor.offer(Message::StreamComplete {
		target: actor.address().clone(),
		sequence: 3,
	})
	.unwrap();

	wait_for(|| *completed.lock().unwrap(), "stream completion");
	assert_eq!(*values.lock().unwrap(), vec![json!(0), json!(10), json!(20)]);

	pool.close();
}
