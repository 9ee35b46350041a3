#![cfg_attr(not(test), no_std)]

//! A lock-free allocator of small integer slots for concurrent
//! systems.
//!
//! Every slot is one bit in a sequence of 32-bit words: `1` means the
//! slot is free, `0` means it has been handed out. Slot 0 is the most
//! significant bit of the first word. Acquiring and releasing slots
//! only ever touches a single word through a compare-and-swap loop, so
//! any number of threads can do it at once without a lock. Growing and
//! resetting the allocator need exclusive access.
//!
//! The allocator only hands out indices; callers keep whatever data
//! belongs to a slot in their own tables.
//!
//! # Example
//!
//! ```rust
//! use slot_bitmap::SlotAllocator;
//!
//! // 8 bytes of bitmap, 64 slots, all free.
//! let mut slots = SlotAllocator::with_byte_len(8);
//! assert_eq!(slots.capacity(), 64);
//!
//! // Slots come out lowest index first
//! assert_eq!(slots.acquire(), Some(0));
//! assert_eq!(slots.acquire(), Some(1));
//!
//! // Give one back, it is the next one handed out
//! slots.release(0);
//! assert_eq!(slots.acquire(), Some(0));
//!
//! // Grow by another word
//! slots.resize(12);
//! assert_eq!(slots.capacity(), 96);
//! assert_eq!(slots.free_slots(), 94);
//!
//! // Save the state and bring it back later
//! let bytes = slots.to_bytes();
//! let restored = SlotAllocator::from_bytes(&bytes);
//! assert_eq!(restored.is_free(1), Some(false));
//! ```

extern crate alloc;

mod error;
mod sync;


pub use error::SlotError;

use alloc::vec::Vec;
use core::fmt;
use core::mem;

use sync::{AtomicU32, Ordering};

const WORD_BITS: usize = u32::BITS as usize;
const WORD_BYTES: usize = mem::size_of::<u32>();
const ALL_FREE: u32 = u32::MAX;

/// Mask for the slot at `local` within its word, counting from the
/// most significant bit.
#[inline]
const fn slot_mask(local: usize) -> u32 {
	(1 << (WORD_BITS - 1)) >> local
}

/// Number of words in `len` bytes of bitmap.
#[inline]
fn words_for(len: usize) -> Result<usize, SlotError> {
	if len % WORD_BYTES != 0 {
		return Err(SlotError::UnalignedLength { len });
	}
	Ok(len / WORD_BYTES)
}

/// A growable, lock-free allocator of slot indices.
///
/// [`acquire()`](Self::acquire) and [`release()`](Self::release)
/// take `&self` and may be called from any number of threads.
/// [`resize()`](Self::resize) and [`reset()`](Self::reset) take
/// `&mut self`; an allocator shared behind an `Arc` can still be reset
/// with [`reset_shared()`](Self::reset_shared) once the caller has
/// made sure nobody else is using it.
pub struct SlotAllocator {
	words: Vec<AtomicU32>,
}

impl SlotAllocator {
	/// An allocator with no slots. [`acquire()`](Self::acquire)
	/// always fails until it is resized.
	pub const fn new() -> Self {
		Self { words: Vec::new() }
	}

	/// An allocator backed by `len` bytes of bitmap, every slot free.
	///
	/// # Panics
	///
	/// Panics if `len` is not a multiple of 4.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::SlotAllocator;
	///
	/// let slots = SlotAllocator::with_byte_len(16);
	/// assert_eq!(slots.capacity(), 128);
	/// assert_eq!(slots.free_slots(), 128);
	/// ```
	#[track_caller]
	pub fn with_byte_len(len: usize) -> Self {
		Self::try_with_byte_len(len)
			.unwrap_or_else(|e| panic!("invalid bitmap size: {e}"))
	}

	/// Like [`SlotAllocator::with_byte_len()`], but returns an error
	/// instead of panicking on a bad length.
	pub fn try_with_byte_len(len: usize) -> Result<Self, SlotError> {
		let count = words_for(len)?;
		Ok(Self {
			words: (0..count).map(|_| AtomicU32::new(ALL_FREE)).collect(),
		})
	}

	/// Imports a bitmap previously exported with
	/// [`SlotAllocator::to_bytes()`]. The bytes are copied verbatim as
	/// native-endian words, so acquired slots stay acquired.
	///
	/// # Panics
	///
	/// Panics if the length of `bytes` is not a multiple of 4.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::SlotAllocator;
	///
	/// // Last slot of the word already taken
	/// let slots = SlotAllocator::from_bytes(&0xffff_fffeu32.to_ne_bytes());
	/// assert_eq!(slots.is_free(31), Some(false));
	/// assert_eq!(slots.free_slots(), 31);
	/// ```
	#[track_caller]
	pub fn from_bytes(bytes: &[u8]) -> Self {
		Self::try_from_bytes(bytes)
			.unwrap_or_else(|e| panic!("invalid bitmap import: {e}"))
	}

	/// Like [`SlotAllocator::from_bytes()`], but returns an error
	/// instead of panicking on a bad length.
	pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, SlotError> {
		words_for(bytes.len())?;
		let words: Vec<AtomicU32> = bytes
			.chunks_exact(WORD_BYTES)
			.map(|chunk| {
				let mut raw = [0; WORD_BYTES];
				raw.copy_from_slice(chunk);
				AtomicU32::new(u32::from_ne_bytes(raw))
			})
			.collect();
		log::debug!(
			"imported slot bitmap of {} bytes ({} slots)",
			bytes.len(),
			words.len() * WORD_BITS,
		);
		Ok(Self { words })
	}

	/// The total number of slots, always a multiple of 32.
	pub fn capacity(&self) -> usize {
		self.words.len() * WORD_BITS
	}

	/// The number of 32-bit words backing the allocator.
	pub fn word_count(&self) -> usize {
		self.words.len()
	}

	/// The size of the bitmap in bytes, as accepted by
	/// [`SlotAllocator::with_byte_len()`] and
	/// [`SlotAllocator::resize()`].
	pub fn byte_len(&self) -> usize {
		self.words.len() * WORD_BYTES
	}

	/// Atomically takes a free slot and returns its index, or [`None`]
	/// if every slot is in use.
	///
	/// Words are scanned from the first one, and within a word the
	/// most significant free bit is taken, so without contention slots
	/// come out in ascending order. Under contention any free slot may
	/// be returned, but never to two callers at once.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::SlotAllocator;
	///
	/// let slots = SlotAllocator::with_byte_len(4);
	/// for i in 0..32 {
	///     assert_eq!(slots.acquire(), Some(i));
	/// }
	/// assert_eq!(slots.acquire(), None);
	/// ```
	pub fn acquire(&self) -> Option<usize> {
		for (i, word) in self.words.iter().enumerate() {
			let mut value = word.load(Ordering::Acquire);

			loop {
				let local = value.leading_zeros() as usize;
				if local >= WORD_BITS {
					// Word is full, go on to the next one.
					break;
				}
				let new = value & !slot_mask(local);

				// A lost race retries on this same word with the value
				// the winner left behind.
				let Err(cur) = word.compare_exchange_weak(
					value,
					new,
					Ordering::AcqRel,
					Ordering::Acquire,
				) else {
					return Some(i * WORD_BITS + local);
				};

				value = cur;
			}
		}

		log::trace!("no free slot among {}", self.capacity());
		None
	}

	/// Returns an acquired slot to the allocator.
	///
	/// # Panics
	///
	/// Panics if `idx` is out of range. With debug assertions enabled
	/// it also panics if the slot is already free; otherwise releasing
	/// a free slot leaves it free.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::SlotAllocator;
	///
	/// let slots = SlotAllocator::with_byte_len(4);
	/// let idx = slots.acquire().unwrap();
	/// assert_eq!(slots.is_free(idx), Some(false));
	///
	/// slots.release(idx);
	/// assert_eq!(slots.is_free(idx), Some(true));
	/// ```
	#[track_caller]
	pub fn release(&self, idx: usize) {
		let capacity = self.capacity();
		assert!(
			idx < capacity,
			"slot {idx} is out of range (capacity {capacity})"
		);
		let was_acquired = self.free_slot(idx);
		debug_assert!(was_acquired, "slot {idx} released twice");
	}

	/// Like [`SlotAllocator::release()`], but reports an out of range
	/// index or a slot that is not acquired as an error.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::{SlotAllocator, SlotError};
	///
	/// let slots = SlotAllocator::with_byte_len(4);
	/// assert_eq!(
	///     slots.try_release(0),
	///     Err(SlotError::NotAcquired { index: 0 })
	/// );
	/// assert_eq!(
	///     slots.try_release(32),
	///     Err(SlotError::OutOfRange { index: 32, capacity: 32 })
	/// );
	///
	/// let idx = slots.acquire().unwrap();
	/// assert_eq!(slots.try_release(idx), Ok(()));
	/// ```
	pub fn try_release(&self, idx: usize) -> Result<(), SlotError> {
		let capacity = self.capacity();
		if idx >= capacity {
			return Err(SlotError::OutOfRange {
				index: idx,
				capacity,
			});
		}
		if !self.free_slot(idx) {
			return Err(SlotError::NotAcquired { index: idx });
		}
		Ok(())
	}

	/// Sets the bit for `idx`. Returns whether the slot was acquired
	/// beforehand; if it was not, the word is left untouched.
	fn free_slot(&self, idx: usize) -> bool {
		let word = &self.words[idx / WORD_BITS];
		let mask = slot_mask(idx % WORD_BITS);
		let mut value = word.load(Ordering::Acquire);

		loop {
			if value & mask != 0 {
				return false;
			}

			let Err(cur) = word.compare_exchange_weak(
				value,
				value | mask,
				Ordering::AcqRel,
				Ordering::Acquire,
			) else {
				return true;
			};

			value = cur;
		}
	}

	/// Whether the slot at `idx` is currently free, or [`None`] if the
	/// index is out of range. The answer may be stale as soon as it
	/// is returned if other threads are using the allocator.
	pub fn is_free(&self, idx: usize) -> Option<bool> {
		let value = self.words.get(idx / WORD_BITS)?.load(Ordering::Acquire);
		Some(value & slot_mask(idx % WORD_BITS) != 0)
	}

	/// Counts the free slots. This is not guaranteed to be exact while
	/// other threads acquire or release slots, because words can only
	/// be read atomically one at a time.
	pub fn free_slots(&self) -> usize {
		self.words
			.iter()
			.map(|w| w.load(Ordering::Acquire).count_ones() as usize)
			.sum()
	}

	/// Grows the bitmap to `len` bytes. Slots in the new words start
	/// free; existing slots keep their state. Growing to the current
	/// size does nothing.
	///
	/// # Panics
	///
	/// Panics if `len` is not a multiple of 4 or if it would shrink
	/// the allocator.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::SlotAllocator;
	///
	/// let mut slots = SlotAllocator::new();
	/// assert_eq!(slots.acquire(), None);
	///
	/// slots.resize(4);
	/// assert_eq!(slots.acquire(), Some(0));
	///
	/// slots.resize(8);
	/// assert_eq!(slots.capacity(), 64);
	/// assert_eq!(slots.is_free(0), Some(false));
	/// assert_eq!(slots.is_free(32), Some(true));
	/// ```
	#[track_caller]
	pub fn resize(&mut self, len: usize) {
		self.try_resize(len)
			.unwrap_or_else(|e| panic!("invalid resize: {e}"))
	}

	/// Like [`SlotAllocator::resize()`], but returns an error instead
	/// of panicking. The allocator is unchanged on error.
	pub fn try_resize(&mut self, len: usize) -> Result<(), SlotError> {
		let count = words_for(len)?;
		let old = self.capacity();
		if count < self.words.len() {
			return Err(SlotError::Shrink {
				current: old,
				requested: count * WORD_BITS,
			});
		}

		self.words.resize_with(count, || AtomicU32::new(ALL_FREE));
		log::debug!("resized slot bitmap from {old} to {} slots", self.capacity());
		Ok(())
	}

	/// Marks every slot free, whether or not someone still holds it.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::SlotAllocator;
	///
	/// let mut slots = SlotAllocator::with_byte_len(4);
	/// while slots.acquire().is_some() {}
	/// assert_eq!(slots.free_slots(), 0);
	///
	/// slots.reset();
	/// assert_eq!(slots.free_slots(), 32);
	/// assert_eq!(slots.acquire(), Some(0));
	/// ```
	pub fn reset(&mut self) {
		// SAFETY: `&mut self` rules out any concurrent access.
		unsafe { self.reset_shared() }
	}

	/// Identical to [`SlotAllocator::reset()`], but through a shared
	/// reference.
	///
	/// # Safety
	///
	/// Words are reset one at a time without a compare-and-swap. The
	/// caller must guarantee that no other thread acquires or releases
	/// slots while this runs, otherwise an acquisition may be
	/// overwritten or a thread may observe a partially reset bitmap.
	/// Slots held by callers before the reset become free and may be
	/// handed out again.
	///
	/// Each word is still written atomically, so this function cannot
	/// produce undefined behavior, only a wrong allocation state.
	///
	/// # Example
	///
	/// ```rust
	/// use std::sync::Arc;
	/// use slot_bitmap::SlotAllocator;
	///
	/// let slots = Arc::new(SlotAllocator::with_byte_len(4));
	/// slots.acquire().unwrap();
	///
	/// // SAFETY: no other thread is using the allocator.
	/// unsafe { slots.reset_shared() };
	/// assert_eq!(slots.free_slots(), 32);
	/// ```
	pub unsafe fn reset_shared(&self) {
		for word in self.words.iter() {
			word.store(ALL_FREE, Ordering::Release);
		}
		log::debug!("reset {} slots", self.capacity());
	}

	/// Copies the bitmap words. Each word is read atomically, but words
	/// can change between reads if other threads are using the
	/// allocator.
	pub fn snapshot(&self) -> Vec<u32> {
		self.words
			.iter()
			.map(|w| w.load(Ordering::Acquire))
			.collect()
	}

	/// The bitmap as native-endian bytes, in the format accepted by
	/// [`SlotAllocator::from_bytes()`]. The same caveat as
	/// [`SlotAllocator::snapshot()`] applies.
	pub fn to_bytes(&self) -> Vec<u8> {
		self.words
			.iter()
			.flat_map(|w| w.load(Ordering::Acquire).to_ne_bytes())
			.collect()
	}

	/// Gets the bitmap words, consuming the allocator.
	///
	/// # Example
	///
	/// ```rust
	/// use slot_bitmap::SlotAllocator;
	///
	/// let slots = SlotAllocator::with_byte_len(8);
	/// slots.acquire().unwrap();
	///
	/// let words = slots.into_words();
	/// assert_eq!(words, [0x7fff_ffff, u32::MAX]);
	///
	/// // Convert back
	/// let slots = SlotAllocator::from(words);
	/// assert_eq!(slots.acquire(), Some(1));
	/// ```
	pub fn into_words(self) -> Vec<u32> {
		// Owning `self` means nobody else can be writing.
		self.words
			.iter()
			.map(|w| w.load(Ordering::Relaxed))
			.collect()
	}
}

impl Default for SlotAllocator {
	/// An allocator with no slots.
	fn default() -> Self {
		Self::new()
	}
}

impl Clone for SlotAllocator {
	/// Copies the current state. See [`SlotAllocator::snapshot()`] for
	/// what that means under concurrent use.
	fn clone(&self) -> Self {
		Self::from(self.snapshot())
	}
}

impl fmt::Debug for SlotAllocator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SlotAllocator")
			.field("capacity", &self.capacity())
			.field("free", &self.free_slots())
			.finish()
	}
}

impl From<Vec<u32>> for SlotAllocator {
	/// Builds an allocator from raw words, trusting their encoding.
	fn from(words: Vec<u32>) -> Self {
		Self {
			words: words.into_iter().map(AtomicU32::new).collect(),
		}
	}
}

impl From<&[u32]> for SlotAllocator {
	fn from(words: &[u32]) -> Self {
		Self {
			words: words.iter().copied().map(AtomicU32::new).collect(),
		}
	}
}

impl TryFrom<&[u8]> for SlotAllocator {
	type Error = SlotError;

	fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
		Self::try_from_bytes(bytes)
	}
}

#[cfg(feature = "serde")]
impl serde::Serialize for SlotAllocator {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.collect_seq(
			self.words.iter().map(|w| w.load(Ordering::Acquire)),
		)
	}
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for SlotAllocator {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let words =
			<Vec<u32> as serde::Deserialize>::deserialize(deserializer)?;
		log::debug!("restored slot bitmap of {} words", words.len());
		Ok(Self::from(words))
	}
}
