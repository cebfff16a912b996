// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Binding of actors to queues and workers.
//!
//! An actor is polymorphic over exactly one capability: handle a message.
//! Each actor owns a mailbox (ring queue plus worker); offers wake the
//! worker, and the journal replay gate holds live delivery back until the
//! replay continuation fires. Handler failures are caught at the delivery
//! boundary: they are logged, queries observe them through their reply,
//! and the worker thread survives.

use std::{
	any::Any,
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use axon_core::{Address, Error, Journal, Message, Result};
use tracing::{debug, error, warn};

use crate::{
	blocker::{CondvarBlocker, NullBlocker, RingBlocker},
	config::ActorConfig,
	outbox::{MessageDeliver, Outbox, RunOne},
	pool::ThreadPool,
	ring::{OfferError, RingQueue, ShutdownMode},
	worker::{Deliver, Worker},
};

/// Bounded wait for the queue to drain on graceful shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The single capability an actor implements.
pub trait Actor: Send + 'static {
	/// Handle one message. Messages emitted to other actors go through
	/// the context's outbox and are flushed at batch end.
	fn handle(&mut self, message: Message, ctx: &mut Context<'_>) -> Result<()>;
}

/// Execution context handed to a handler invocation.
///
/// Wraps the delivering thread's outbox; an explicit value, never an
/// ambient static.
pub struct Context<'a> {
	outbox: &'a mut Outbox<Envelope>,
}

impl Context<'_> {
	/// Emit a message to another actor. It leaves with the batch flush,
	/// in emission order.
	pub fn send(&mut self, target: &ActorRef, message: Message) {
		self.outbox.accept(Envelope::new(message, Arc::clone(&target.mailbox)));
	}

	/// Messages currently accumulated in the outbox.
	pub fn pending(&self) -> usize {
		self.outbox.len()
	}
}

/// A message bound to its destination mailbox.
pub struct Envelope {
	/// Consumed on delivery; a pending reply in a dropped envelope is
	/// failed so producers never wait on a discarded query.
	message: Option<Message>,
	target: Arc<Mailbox>,
}

impl Envelope {
	pub fn new(message: Message, target: Arc<Mailbox>) -> Self {
		Self {
			message: Some(message),
			target,
		}
	}

	pub fn message(&self) -> &Message {
		self.message.as_ref().expect("envelope already consumed")
	}

	pub fn into_message(mut self) -> Message {
		self.message.take().expect("envelope already consumed")
	}
}

impl Drop for Envelope {
	fn drop(&mut self) {
		if let Some(message) = self.message.take() {
			if let Some(reply) = message.reply() {
				reply.fail(Error::QueueClosed);
			}
		}
	}
}

impl MessageDeliver for Envelope {
	fn offer_target(self, timeout: Option<Duration>) -> std::result::Result<(), Self> {
		let target = Arc::clone(&self.target);
		target.offer_envelope(self, timeout)
	}

	fn run_one_target(self, outbox: &mut Outbox<Self>) -> RunOne<Self> {
		let target = Arc::clone(&self.target);
		target.run_one(self, outbox)
	}
}

/// Consumer callback dispatching envelopes into an actor, with journal
/// hooks around each send/query and a flush at batch boundaries.
pub struct ActorDeliver {
	address: Address,
	actor: Box<dyn Actor>,
	journal: Arc<dyn Journal>,
}

impl ActorDeliver {
	pub fn new(address: Address, actor: Box<dyn Actor>, journal: Arc<dyn Journal>) -> Self {
		Self {
			address,
			actor,
			journal,
		}
	}
}

impl Deliver<Envelope> for ActorDeliver {
	fn deliver(&mut self, envelope: Envelope, outbox: &mut Outbox<Envelope>) -> Result<()> {
		let message = envelope.into_message();

		// durability hooks run on the delivering thread, before the
		// message takes effect
		match &message {
			Message::Send {
				target,
				method,
				args,
				..
			} => self.journal.write_send(target, method, args),
			Message::Query {
				target,
				method,
				args,
				..
			} => self.journal.write_query(target, method, args),
			_ => {}
		}

		let reply = message.reply().cloned();
		let mut ctx = Context {
			outbox,
		};

		match catch_unwind(AssertUnwindSafe(|| self.actor.handle(message, &mut ctx))) {
			Ok(Ok(())) => Ok(()),
			Ok(Err(error)) => {
				warn!(actor = %self.address, %error, "handler returned an error");
				if let Some(reply) = reply {
					reply.fail(error);
				}
				Ok(())
			}
			Err(panic) => {
				let detail = panic_detail(panic.as_ref());
				error!(actor = %self.address, panic = %detail, "handler panicked; worker continues");
				if let Some(reply) = reply {
					reply.fail(Error::HandlerPanic(detail));
				}
				Ok(())
			}
		}
	}

	fn after_batch(&mut self) {
		self.journal.flush();
	}

	fn shutdown(&mut self, _mode: ShutdownMode) {
		self.journal.flush();
	}
}

fn panic_detail(panic: &(dyn Any + Send)) -> String {
	if let Some(text) = panic.downcast_ref::<&str>() {
		(*text).to_string()
	} else if let Some(text) = panic.downcast_ref::<String>() {
		text.clone()
	} else {
		"unknown panic".to_string()
	}
}

/// One actor's delivery queue and worker.
pub struct Mailbox {
	address: Address,
	queue: Arc<RingQueue<Envelope>>,
	worker: Arc<Worker<Envelope, ActorDeliver>>,
	/// Live delivery is gated until the journal replay completes.
	replaying: AtomicBool,
	journal: Arc<dyn Journal>,
}

impl Mailbox {
	pub fn address(&self) -> &Address {
		&self.address
	}

	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	pub fn pending(&self) -> usize {
		self.queue.len()
	}

	pub fn is_closed(&self) -> bool {
		self.queue.is_closed()
	}

	/// Wake the worker unless replay still holds delivery back.
	pub fn wake(&self) {
		if !self.replaying.load(Ordering::Acquire) {
			self.worker.wake();
		}
	}

	fn offer_envelope(&self, envelope: Envelope, timeout: Option<Duration>) -> std::result::Result<(), Envelope> {
		match self.queue.offer(envelope, timeout) {
			Ok(()) => {
				self.wake();
				Ok(())
			}
			Err(error) => Err(error.into_inner()),
		}
	}

	fn try_offer_envelope(&self, envelope: Envelope) -> Result<()> {
		match self.queue.try_offer(envelope) {
			Ok(()) => {
				self.wake();
				Ok(())
			}
			Err(OfferError::Full(_)) => Err(Error::QueueFull),
			Err(OfferError::Closed(_)) => Err(Error::QueueClosed),
		}
	}

	fn run_one(&self, envelope: Envelope, outbox: &mut Outbox<Envelope>) -> RunOne<Envelope> {
		if self.replaying.load(Ordering::Acquire) {
			// queue behind the replay; delivered once live delivery
			// resumes
			return match self.queue.try_offer(envelope) {
				Ok(()) => RunOne::Done,
				Err(OfferError::Full(envelope)) => RunOne::Retry(envelope),
				Err(OfferError::Closed(envelope)) => {
					drop(envelope);
					RunOne::Done
				}
			};
		}

		self.worker.run_one(envelope, outbox)
	}

	/// Drive the journal replay pass and release live delivery once its
	/// continuation fires.
	fn start(mailbox: &Arc<Mailbox>) {
		let on_done = Arc::clone(mailbox);
		let done = axon_core::Reply::new(move |result| {
			if let Err(error) = &result {
				error!(actor = %on_done.address, %error, "journal replay failed; resuming live delivery");
			} else {
				debug!(actor = %on_done.address, "journal replay complete");
			}
			on_done.replaying.store(false, Ordering::Release);
			on_done.worker.wake();
		});

		let sink = Arc::clone(mailbox);
		let journal = Arc::clone(&mailbox.journal);
		journal.replay_start(done, &mut |message| {
			match sink.queue.try_offer(Envelope::new(message, Arc::clone(&sink))) {
				Ok(()) => Ok(()),
				Err(OfferError::Full(_)) => Err(Error::QueueFull),
				Err(OfferError::Closed(_)) => Err(Error::QueueClosed),
			}
		});
	}

	pub fn shutdown(&self, mode: ShutdownMode) {
		match mode {
			ShutdownMode::Graceful => {
				self.queue.close();
				self.worker.wake();

				if !self.worker.drain_wait(SHUTDOWN_DRAIN_TIMEOUT) {
					warn!(actor = %self.address, "graceful shutdown timed out with messages still queued");
				}

				self.worker.shutdown(mode);
				self.queue.shutdown(mode);
			}
			ShutdownMode::Immediate => {
				self.worker.shutdown(mode);
				// discards queued envelopes; their replies fail on drop
				self.queue.shutdown(mode);
			}
		}
	}
}

/// Public handle to one actor.
#[derive(Clone)]
pub struct ActorRef {
	mailbox: Arc<Mailbox>,
}

impl ActorRef {
	/// Create an actor's mailbox and worker and start its replay pass.
	pub fn launch(
		address: impl Into<Address>,
		actor: impl Actor,
		pool: &ThreadPool,
		journal: Arc<dyn Journal>,
		config: &ActorConfig,
	) -> Result<ActorRef> {
		config.validate()?;

		let address = address.into();

		let blocker: Arc<dyn RingBlocker> = if config.queue.blocking {
			Arc::new(CondvarBlocker::new())
		} else {
			Arc::new(NullBlocker)
		};

		let queue = Arc::new(RingQueue::new(config.queue.capacity, blocker));

		let deliver = ActorDeliver::new(address.clone(), Box::new(actor), Arc::clone(&journal));
		let worker = Worker::new(address.as_str(), Arc::clone(&queue), deliver, pool.clone(), &config.worker);

		let mailbox = Arc::new(Mailbox {
			address,
			queue,
			worker,
			replaying: AtomicBool::new(true),
			journal,
		});

		Mailbox::start(&mailbox);

		Ok(ActorRef {
			mailbox,
		})
	}

	pub fn address(&self) -> &Address {
		self.mailbox.address()
	}

	/// Non-blocking offer. A full queue reports back immediately; the
	/// caller decides whether to retry, drop or backpressure.
	pub fn offer(&self, message: Message) -> Result<()> {
		self.mailbox.try_offer_envelope(Envelope::new(message, Arc::clone(&self.mailbox)))
	}

	/// Blocking offer. `None` waits indefinitely for queue space.
	pub fn offer_wait(&self, message: Message, timeout: Option<Duration>) -> Result<()> {
		let envelope = Envelope::new(message, Arc::clone(&self.mailbox));
		match self.mailbox.offer_envelope(envelope, timeout) {
			Ok(()) => Ok(()),
			Err(envelope) => {
				let error = if self.mailbox.is_closed() {
					Error::QueueClosed
				} else {
					Error::QueueFull
				};
				drop(envelope);
				Err(error)
			}
		}
	}

	/// Fire-and-forget convenience over [`ActorRef::offer`].
	pub fn send(&self, method: impl Into<String>, args: Vec<serde_json::Value>) -> Result<()> {
		self.offer(Message::send(self.address().clone(), method, args))
	}

	/// Query convenience over [`ActorRef::offer`].
	pub fn query(
		&self,
		method: impl Into<String>,
		args: Vec<serde_json::Value>,
		reply: axon_core::Reply,
	) -> Result<()> {
		self.offer(Message::query(self.address().clone(), method, args, reply))
	}

	pub fn wake(&self) {
		self.mailbox.wake();
	}

	pub fn is_closed(&self) -> bool {
		self.mailbox.is_closed()
	}

	pub fn is_empty(&self) -> bool {
		self.mailbox.is_empty()
	}

	pub fn pending(&self) -> usize {
		self.mailbox.pending()
	}

	pub fn shutdown(&self, mode: ShutdownMode) {
		self.mailbox.shutdown(mode);
	}
}
