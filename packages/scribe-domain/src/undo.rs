use std::collections::VecDeque;

/// Bounded history of previous values. Pushing past capacity forgets the oldest entry.
#[derive(Debug, Clone)]
pub struct UndoStack<T> {
	entries: VecDeque<T>,
	capacity: usize,
}
impl<T> UndoStack<T> {
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);

		Self { entries: VecDeque::with_capacity(capacity), capacity }
	}

	pub fn push(&mut self, previous: T) {
		if self.entries.len() == self.capacity {
			self.entries.pop_front();
		}

		self.entries.push_back(previous);
	}

	pub fn pop(&mut self) -> Option<T> {
		self.entries.pop_back()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}
}
