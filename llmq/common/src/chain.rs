// This file is part of Gear.
//
// Copyright (C) 2025 Gear Technologies Inc.
// SPDX-License-Identifier: GPL-3.0-or-later WITH Classpath-exception-2.0
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Read-only view of the active chain and the lock ordering around it.
//!
//! Lock order: the chain-state lock is always taken first. A [`CacheMutex`]
//! may be taken while holding it, never the other way round. Debug builds
//! track cache locks held by the current thread and panic on inversion.

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};
use primitive_types::H256;
use std::{
    cell::Cell,
    ops::{Deref, DerefMut},
};

thread_local! {
    static CACHE_LOCKS_HELD: Cell<usize> = const { Cell::new(0) };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockIndex {
    pub hash: H256,
    pub height: u32,
    /// Block was fully validated.
    pub valid_scripts: bool,
}

/// Chain state provider.
#[auto_impl::auto_impl(&, Box, Arc)]
pub trait ChainState: Send + Sync {
    /// Lock guarding multi-step reads of the chain.
    fn lock(&self) -> &ChainStateLock;

    fn tip(&self) -> Option<BlockIndex>;

    fn active_height(&self) -> u32 {
        self.tip().map(|tip| tip.height).unwrap_or_default()
    }

    /// Block of the active chain at `height`.
    fn block_at(&self, height: u32) -> Option<BlockIndex>;

    /// Any known block, active or not.
    fn lookup_block(&self, hash: &H256) -> Option<BlockIndex>;

    /// Ancestor of `block` at `height`.
    fn ancestor(&self, block: &BlockIndex, height: u32) -> Option<BlockIndex>;

    fn contains(&self, block: &BlockIndex) -> bool {
        self.block_at(block.height)
            .is_some_and(|active| active.hash == block.hash)
    }
}

/// Reentrant lock over the chain state.
#[derive(Default)]
pub struct ChainStateLock(ReentrantMutex<()>);

pub struct ChainStateGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl ChainStateLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> ChainStateGuard<'_> {
        debug_assert_eq!(
            CACHE_LOCKS_HELD.with(Cell::get),
            0,
            "chain state lock taken while holding a cache lock"
        );
        ChainStateGuard {
            _guard: self.0.lock(),
        }
    }
}

/// Mutex that must never be held while taking the chain-state lock.
#[derive(Debug, Default)]
pub struct CacheMutex<T>(Mutex<T>);

pub struct CacheMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> CacheMutex<T> {
    pub fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    pub fn lock(&self) -> CacheMutexGuard<'_, T> {
        let guard = self.0.lock();
        CACHE_LOCKS_HELD.with(|held| held.set(held.get() + 1));
        CacheMutexGuard { guard }
    }
}

impl<T> Deref for CacheMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for CacheMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for CacheMutexGuard<'_, T> {
    fn drop(&mut self) {
        CACHE_LOCKS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_lock_inside_chain_lock() {
        let chain = ChainStateLock::new();
        let cache = CacheMutex::new(1);

        let _chain = chain.lock();
        let _again = chain.lock();
        *cache.lock() += 1;
        assert_eq!(*cache.lock(), 2);
    }

    #[test]
    fn chain_lock_after_cache_released() {
        let chain = ChainStateLock::new();
        let cache = CacheMutex::new(());

        drop(cache.lock());
        let _chain = chain.lock();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "chain state lock taken while holding a cache lock")]
    fn chain_lock_inside_cache_lock_panics() {
        let chain = ChainStateLock::new();
        let cache = CacheMutex::new(());

        let _cache = cache.lock();
        let _chain = chain.lock();
    }
}
