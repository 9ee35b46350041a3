use thiserror::Error;

/// Errors returned by the checked (`try_*`) operations of
/// [`SlotAllocator`](crate::SlotAllocator).
///
/// The unchecked counterparts treat the same conditions as caller
/// bugs and panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SlotError {
	/// A byte length was not a whole number of 32-bit words.
	#[error("byte length {len} is not a multiple of 4")]
	UnalignedLength { len: usize },

	/// A resize asked for fewer slots than the allocator holds.
	#[error("cannot shrink from {current} to {requested} slots")]
	Shrink { current: usize, requested: usize },

	/// A slot index was past the end of the allocator.
	#[error("slot {index} is out of range (capacity {capacity})")]
	OutOfRange { index: usize, capacity: usize },

	/// A slot was released while already free.
	#[error("slot {index} is not acquired")]
	NotAcquired { index: usize },
}
