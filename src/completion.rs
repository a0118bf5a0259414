use std::{
	future::Future,
	pin::Pin,
	sync::Arc,
	task::{Context, Poll, Waker},
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;

struct Shared<T> {
	value: Option<T>,
	settled: bool,
	cancelled: bool,
	waker: Option<Waker>,
}

/// A one-shot settable future.
///
/// Producers hold a clone and call [`Completion::set`]; the consumer awaits
/// the original handle. Awaiting resolves to `None` iff the completion was
/// cancelled before it was settled. A cancelled completion can never be
/// settled afterwards, and settling is a no-op after the first `set`.
pub struct Completion<T> {
	shared: Arc<Mutex<Shared<T>>>,
}

assert_impl_all!(Completion<Vec<u8>>: Send, Sync, Unpin);

impl<T> Clone for Completion<T> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<T> Default for Completion<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> Completion<T> {
	pub fn new() -> Self {
		Self {
			shared: Arc::new(Mutex::new(Shared {
				value: None,
				settled: false,
				cancelled: false,
				waker: None,
			})),
		}
	}

	/// Settles the completion. Returns false if it was already settled or
	/// cancelled, in which case `value` is dropped.
	pub fn set(&self, value: T) -> bool {
		let mut shared = self.shared.lock();
		if shared.settled || shared.cancelled {
			return false;
		}
		shared.value = Some(value);
		shared.settled = true;
		if let Some(waker) = shared.waker.take() {
			waker.wake();
		}
		true
	}

	/// Cancels the completion. Returns false if it was already settled;
	/// cancelling twice is a no-op that reports true.
	pub fn cancel(&self) -> bool {
		let mut shared = self.shared.lock();
		if shared.settled {
			return false;
		}
		shared.cancelled = true;
		if let Some(waker) = shared.waker.take() {
			waker.wake();
		}
		true
	}

	pub fn is_settled(&self) -> bool {
		self.shared.lock().settled
	}

	pub fn is_cancelled(&self) -> bool {
		self.shared.lock().cancelled
	}
}

impl<V, E> Completion<Result<V, E>> {
	/// Settles the completion exceptionally, so the awaiter observes the
	/// error. Returns false if it was already settled or cancelled.
	pub fn set_error(&self, error: E) -> bool {
		self.set(Err(error))
	}
}

impl<T> Future for Completion<T> {
	type Output = Option<T>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut shared = self.shared.lock();
		if shared.cancelled {
			return Poll::Ready(None);
		}
		if shared.settled {
			return Poll::Ready(shared.value.take());
		}
		shared.waker = Some(cx.waker().clone());
		Poll::Pending
	}
}
