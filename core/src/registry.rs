//! Consumer registry seam.
//!
//! The proxy core never assumes a particular runtime's notion of "clients";
//! whatever hosts it supplies something that can count the attached
//! consumers and broadcast one token to all of them.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

pub trait ConsumerRegistry: Send + Sync + 'static {
	/// Number of currently-attached consumers.
	fn attached_count(&self) -> usize;

	/// Sends one token to every attached consumer.
	fn broadcast(&self, message: &str);
}

/// Channel-backed registry: one sender per attached consumer, swept as
/// consumers go away. Broadcast send errors just mean a consumer left.
#[derive(Debug, Default, Clone)]
pub struct ChannelRegistry {
	consumers: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
}

impl ChannelRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Attaches one consumer; dropping the returned receiver detaches it.
	pub fn attach(&self) -> mpsc::UnboundedReceiver<String> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.lock().push(tx);
		rx
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<String>>> {
		self.consumers.lock().expect("consumer registry lock poisoned")
	}
}

impl ConsumerRegistry for ChannelRegistry {
	fn attached_count(&self) -> usize {
		let mut consumers = self.lock();
		consumers.retain(|tx| !tx.is_closed());
		consumers.len()
	}

	fn broadcast(&self, message: &str) {
		self.lock()
			.retain(|tx| tx.send(message.to_string()).is_ok());
	}
}
