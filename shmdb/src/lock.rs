// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Segment-resident reader-writer lock.
//!
//! The lock is a single atomic word in the segment header, shared by every
//! process that maps the segment, plus a token counter. Layout of the
//! state word:
//!
//! ```text
//! bits  0..32   active reader count
//! bit  32       writer active
//! bits 33..64   writers waiting
//! ```
//!
//! Arriving readers defer to waiting writers, so a steady stream of
//! readers cannot starve a writer. Waiting is spin-then-yield: a futex
//! would not be portable across the process boundary this lock lives on.
//!
//! `start_read`/`start_write` may block indefinitely; there is no
//! cancellation. If a holder dies the lock stays taken and must be cleared
//! by [reset] after all participants have been restarted.

use crate::segment::Seg;
use std::sync::atomic::Ordering;

const READER: u64 = 1;
const READER_MASK: u64 = 0xffff_ffff;
const WRITER: u64 = 1 << 32;
const WAITER: u64 = 1 << 33;

/// Spins before each yield to the scheduler.
const SPINS_PER_YIELD: u32 = 64;

/// Token returned by a successful read acquire. Bounded-range integer, not
/// a pointer, so a stale token is recognizable after crash recovery.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a read token must be returned via end_read"]
pub struct ReadToken(pub(crate) u32);

/// Token returned by a successful write acquire.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a write token must be returned via end_write"]
pub struct WriteToken(pub(crate) u32);

fn next_token(seg: &Seg) -> u32 {
    // Tokens stay in 1..=0xffff; zero means "no lock".
    let raw = seg.header().lock_token.fetch_add(1, Ordering::Relaxed);
    (raw % 0xffff) + 1
}

fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins % SPINS_PER_YIELD == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// Block until a shared read hold is granted.
pub(crate) fn start_read(seg: &Seg) -> ReadToken {
    let state = &seg.header().lock_state;
    let mut spins = 0;
    loop {
        let s = state.load(Ordering::Relaxed);
        // Writers (active or queued) go first.
        if s & WRITER == 0 && s / WAITER == 0 {
            if state
                .compare_exchange_weak(s, s + READER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return ReadToken(next_token(seg));
            }
        }
        backoff(&mut spins);
    }
}

pub(crate) fn end_read(seg: &Seg, token: ReadToken) {
    debug_assert_ne!(0, token.0);
    seg.header().lock_state.fetch_sub(READER, Ordering::Release);
}

/// Block until the exclusive write hold is granted.
pub(crate) fn start_write(seg: &Seg) -> WriteToken {
    let state = &seg.header().lock_state;
    state.fetch_add(WAITER, Ordering::Relaxed);
    let mut spins = 0;
    loop {
        let s = state.load(Ordering::Relaxed);
        if s & (WRITER | READER_MASK) == 0 {
            let granted = s - WAITER + WRITER;
            if state
                .compare_exchange_weak(s, granted, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return WriteToken(next_token(seg));
            }
        }
        backoff(&mut spins);
    }
}

pub(crate) fn end_write(seg: &Seg, token: WriteToken) {
    debug_assert_ne!(0, token.0);
    seg.header().lock_state.fetch_sub(WRITER, Ordering::Release);
}

/// Administrative reset after a crashed holder, once every participant has
/// been restarted. Clearing the word while any holder is alive corrupts
/// the lock discipline.
pub(crate) fn reset(seg: &Seg) {
    seg.header().lock_state.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{test_seg, DATA_START};
    use std::sync::Arc;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_tokens_are_bounded_nonzero() {
        let seg = test_seg(1 << 20);
        for _ in 0..100 {
            let t = start_read(&seg);
            assert!(t.0 >= 1 && t.0 <= 0xffff);
            end_read(&seg, t);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_readers_share() {
        let seg = test_seg(1 << 20);
        let a = start_read(&seg);
        let b = start_read(&seg);
        end_read(&seg, a);
        end_read(&seg, b);
        let w = start_write(&seg);
        end_write(&seg, w);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_writer_exclusion() {
        // Two threads hammering unsynchronized increments under the write
        // lock; any lost update means exclusion failed.
        let seg = Arc::new(test_seg(1 << 20));
        let cell = DATA_START;
        const THREADS: usize = 4;
        const ROUNDS: u64 = 2000;
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let seg = Arc::clone(&seg);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let t = start_write(&seg);
                    let v = seg.load(cell);
                    seg.store(cell, v + 1);
                    end_write(&seg, t);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(THREADS as u64 * ROUNDS, seg.load(cell));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_reset_clears_dead_holder() {
        let seg = test_seg(1 << 20);
        let t = start_write(&seg);
        std::mem::forget(t); // simulate a holder that died
        reset(&seg);
        let t = start_write(&seg);
        end_write(&seg, t);
    }
}
