// Copyright 2026 tarn Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Paged slot storage shared by the expiration and usage indexes.
//!
//! A [`SlotArena`] is a growable array of fixed-size pages. Slot 0 of every page is a header that holds the number of
//! free slots in the page and the head of the page's intra-page free list. Pages are threaded on two doubly linked
//! page lists:
//!
//! - the free page list holds pages without a slot array (never used, or released after being emptied);
//! - the partial page list holds pages that own a slot array with a header free count in `[1, 127]`.
//!
//! Full pages are on no list. Allocation and release are O(1) and never walk the page array.

use std::collections::TryReserveError;

use tarn_common::error::{Error, ErrorKind};

/// Slots per page, including the header slot.
pub const PAGE_SLOTS: usize = 128;
/// Usable slots per page.
pub const PAGE_CAPACITY: usize = PAGE_SLOTS - 1;

const MIN_PAGES_INCREMENT: usize = 10;
const MAX_PAGES_INCREMENT: usize = 340;

/// Handle of an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    page: u32,
    slot: u8,
}

impl SlotRef {
    pub(crate) fn new(page: u32, slot: u8) -> Self {
        Self { page, slot }
    }

    /// Page index.
    pub fn page(&self) -> u32 {
        self.page
    }

    /// Slot index within the page, in `1..128`.
    pub fn slot(&self) -> u8 {
        self.slot
    }
}

/// Errors raised when the arena cannot grow.
#[derive(thiserror::Error, Debug)]
pub enum SlabError {
    /// The page array has reached the addressable page count.
    #[error("page array cannot grow beyond {pages} pages")]
    Exhausted {
        /// Current page count.
        pages: usize,
    },
    /// The page array allocation failed.
    #[error("failed to grow page array from {pages} by {additional} pages")]
    Grow {
        /// Current page count.
        pages: usize,
        /// Requested increment.
        additional: usize,
        /// Allocator error.
        #[source]
        source: TryReserveError,
    },
    /// The slot array allocation of a page failed.
    #[error("failed to allocate slots of page {page}")]
    Page {
        /// Page index.
        page: u32,
        /// Allocator error.
        #[source]
        source: TryReserveError,
    },
}

impl From<SlabError> for Error {
    fn from(e: SlabError) -> Self {
        Error::new(ErrorKind::NoSpace, "slot storage cannot grow").with_source(e)
    }
}

#[derive(Debug)]
enum Slot<T> {
    Header { free: u8, head: u8 },
    Free { next: u8 },
    Occupied(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageList {
    Free,
    Partial,
}

#[derive(Debug)]
struct Page<T> {
    slots: Option<Box<[Slot<T>]>>,
    prev: Option<u32>,
    next: Option<u32>,
    list: Option<PageList>,
}

impl<T> Page<T> {
    fn vacant() -> Self {
        Self {
            slots: None,
            prev: None,
            next: None,
            list: None,
        }
    }
}

fn header<T>(slots: &[Slot<T>]) -> (u8, u8) {
    match slots[0] {
        Slot::Header { free, head } => (free, head),
        _ => unreachable!("slot 0 must be the page header"),
    }
}

fn set_header<T>(slots: &mut [Slot<T>], free: u8, head: u8) {
    slots[0] = Slot::Header { free, head };
}

/// Growable paged slot storage with O(1) allocate and release.
#[derive(Debug)]
pub struct SlotArena<T> {
    pages: Vec<Page<T>>,
    free_pages: Option<u32>,
    partial_pages: Option<u32>,
    len: usize,
    live_pages: usize,
    shrink_suppressed: bool,
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotArena<T> {
    /// Create an empty arena. No page is allocated until the first insertion.
    pub const fn new() -> Self {
        Self {
            pages: Vec::new(),
            free_pages: None,
            partial_pages: None,
            len: 0,
            live_pages: 0,
            shrink_suppressed: false,
        }
    }

    /// Occupied slot count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Page array length, including pages without slots.
    pub fn pages(&self) -> usize {
        self.pages.len()
    }

    /// Pages that currently own a slot array.
    pub fn live_pages(&self) -> usize {
        self.live_pages
    }

    /// Store `value` in a free slot.
    pub fn insert(&mut self, value: T) -> Result<SlotRef, SlabError> {
        let page = match self.partial_pages {
            Some(page) => page,
            None => self.activate_page()?,
        };

        let (full, slot) = {
            let Some(slots) = self.pages[page as usize].slots.as_mut() else {
                unreachable!("a page with free slots must own its slot array");
            };
            let (free, head) = header(slots);
            let next = match slots[head as usize] {
                Slot::Free { next } => next,
                _ => unreachable!("the free list head must be a free slot"),
            };
            slots[head as usize] = Slot::Occupied(value);
            set_header(slots, free - 1, next);
            self.len += 1;
            (free == 1, head)
        };

        if full {
            self.unlink(page);
        }

        Ok(SlotRef::new(page, slot))
    }

    /// Release the slot and return its value.
    ///
    /// Returns `None` if the handle does not name an occupied slot.
    pub fn remove(&mut self, slot: SlotRef) -> Option<T> {
        let index = slot.slot as usize;
        if index == 0 || index >= PAGE_SLOTS {
            return None;
        }

        let (value, was_full, now_empty) = {
            let slots = self.pages.get_mut(slot.page as usize)?.slots.as_mut()?;
            if !matches!(slots[index], Slot::Occupied(_)) {
                return None;
            }
            let (free, head) = header(slots);
            let Slot::Occupied(value) = std::mem::replace(&mut slots[index], Slot::Free { next: head }) else {
                unreachable!()
            };
            set_header(slots, free + 1, slot.slot);
            (value, free == 0, free as usize + 1 == PAGE_CAPACITY)
        };
        self.len -= 1;

        if was_full {
            self.push_front(slot.page, PageList::Partial);
        }
        if now_empty && self.can_shrink() {
            self.release(slot.page);
        }

        Some(value)
    }

    /// Get the value of an occupied slot.
    pub fn get(&self, slot: SlotRef) -> Option<&T> {
        let slots = self.pages.get(slot.page as usize)?.slots.as_ref()?;
        match slots.get(slot.slot as usize)? {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Get the mutable value of an occupied slot.
    pub fn get_mut(&mut self, slot: SlotRef) -> Option<&mut T> {
        let slots = self.pages.get_mut(slot.page as usize)?.slots.as_mut()?;
        match slots.get_mut(slot.slot as usize)? {
            Slot::Occupied(value) => Some(value),
            _ => None,
        }
    }

    /// Iterate over occupied slots. Pages without live slots are skipped by their header.
    pub fn iter(&self) -> impl Iterator<Item = (SlotRef, &T)> + '_ {
        self.pages
            .iter()
            .enumerate()
            .filter_map(|(page, p)| p.slots.as_ref().map(|slots| (page as u32, slots)))
            .filter(|(_, slots)| (header(slots).0 as usize) < PAGE_CAPACITY)
            .flat_map(|(page, slots)| {
                slots.iter().enumerate().skip(1).filter_map(move |(slot, s)| match s {
                    Slot::Occupied(value) => Some((SlotRef::new(page, slot as u8), value)),
                    _ => None,
                })
            })
    }

    /// Suppress or allow page release.
    ///
    /// Walkers that release slots while holding handles of other slots suppress shrinking, then call
    /// [`SlotArena::release_empty_pages`] when done.
    pub fn set_shrink_suppressed(&mut self, suppressed: bool) {
        self.shrink_suppressed = suppressed;
    }

    /// Release pages emptied while shrinking was suppressed, as long as the load allows it.
    pub fn release_empty_pages(&mut self) {
        let mut cursor = self.partial_pages;
        while let Some(page) = cursor {
            cursor = self.pages[page as usize].next;
            let empty = self.pages[page as usize]
                .slots
                .as_ref()
                .is_some_and(|slots| header(slots).0 as usize == PAGE_CAPACITY);
            if empty && self.can_shrink() {
                self.release(page);
            }
        }
    }

    /// Take all values out and reset the arena.
    pub fn drain(&mut self) -> Vec<T> {
        let pages = std::mem::take(&mut self.pages);
        let values = pages
            .into_iter()
            .filter_map(|page| page.slots)
            .flat_map(|slots| slots.into_vec().into_iter())
            .filter_map(|slot| match slot {
                Slot::Occupied(value) => Some(value),
                _ => None,
            })
            .collect();
        *self = Self::new();
        values
    }

    fn can_shrink(&self) -> bool {
        !self.shrink_suppressed && self.len * 2 < self.live_pages * PAGE_CAPACITY
    }

    fn activate_page(&mut self) -> Result<u32, SlabError> {
        if self.free_pages.is_none() {
            self.grow()?;
        }
        let Some(page) = self.free_pages else {
            return Err(SlabError::Exhausted {
                pages: self.pages.len(),
            });
        };

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(PAGE_SLOTS)
            .map_err(|source| SlabError::Page { page, source })?;
        slots.push(Slot::Header {
            free: PAGE_CAPACITY as u8,
            head: 1,
        });
        for index in 1..PAGE_SLOTS {
            let next = if index + 1 < PAGE_SLOTS { index as u8 + 1 } else { 0 };
            slots.push(Slot::Free { next });
        }

        self.unlink(page);
        self.pages[page as usize].slots = Some(slots.into_boxed_slice());
        self.live_pages += 1;
        self.push_front(page, PageList::Partial);

        Ok(page)
    }

    fn grow(&mut self) -> Result<(), SlabError> {
        let pages = self.pages.len();
        let additional = pages.clamp(MIN_PAGES_INCREMENT, MAX_PAGES_INCREMENT);
        if pages + additional > u32::MAX as usize {
            return Err(SlabError::Exhausted { pages });
        }
        self.pages
            .try_reserve_exact(additional)
            .map_err(|source| SlabError::Grow {
                pages,
                additional,
                source,
            })?;
        self.pages.extend((0..additional).map(|_| Page::vacant()));
        for page in (pages..pages + additional).rev() {
            self.push_front(page as u32, PageList::Free);
        }
        Ok(())
    }

    fn release(&mut self, page: u32) {
        self.unlink(page);
        self.pages[page as usize].slots = None;
        self.live_pages -= 1;
        self.push_front(page, PageList::Free);
        self.truncate();
    }

    /// Drop trailing pages that own no slot array.
    fn truncate(&mut self) {
        while let Some(last) = self.pages.last() {
            if last.slots.is_some() {
                break;
            }
            let page = self.pages.len() as u32 - 1;
            self.unlink(page);
            self.pages.pop();
        }
    }

    fn head_mut(&mut self, list: PageList) -> &mut Option<u32> {
        match list {
            PageList::Free => &mut self.free_pages,
            PageList::Partial => &mut self.partial_pages,
        }
    }

    fn push_front(&mut self, page: u32, list: PageList) {
        let head = *self.head_mut(list);
        {
            let p = &mut self.pages[page as usize];
            p.prev = None;
            p.next = head;
            p.list = Some(list);
        }
        if let Some(head) = head {
            self.pages[head as usize].prev = Some(page);
        }
        *self.head_mut(list) = Some(page);
    }

    fn unlink(&mut self, page: u32) {
        let (prev, next, list) = {
            let p = &mut self.pages[page as usize];
            (p.prev.take(), p.next.take(), p.list.take())
        };
        let Some(list) = list else { return };
        match prev {
            Some(prev) => self.pages[prev as usize].next = next,
            None => *self.head_mut(list) = next,
        }
        if let Some(next) = next {
            self.pages[next as usize].prev = prev;
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let mut live = 0;
        let mut occupied = 0;
        for (index, page) in self.pages.iter().enumerate() {
            match page.slots.as_ref() {
                Some(slots) => {
                    live += 1;
                    let (free, _) = header(slots);
                    let used = slots.iter().filter(|s| matches!(s, Slot::Occupied(_))).count();
                    assert_eq!(free as usize + used, PAGE_CAPACITY, "page {index}");
                    occupied += used;
                    match free {
                        0 => assert_eq!(page.list, None, "page {index}"),
                        _ => assert_eq!(page.list, Some(PageList::Partial), "page {index}"),
                    }
                }
                None => assert_eq!(page.list, Some(PageList::Free), "page {index}"),
            }
        }
        assert_eq!(live, self.live_pages);
        assert_eq!(occupied, self.len);
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = SlotArena::new();
        let a = arena.insert("a").unwrap();
        let b = arena.insert("b").unwrap();
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_ne!(a, b);
        assert_eq!(a.page(), b.page());

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.len(), 1);

        // The released slot is reused first.
        let c = arena.insert("c").unwrap();
        assert_eq!(c, a);
        arena.check_invariants();
    }

    #[test]
    fn test_header_slot_is_never_handed_out() {
        let mut arena = SlotArena::new();
        let refs = (0..PAGE_CAPACITY * 3).map(|i| arena.insert(i).unwrap()).collect_vec();
        assert!(refs.iter().all(|r| r.slot() != 0));
        assert_eq!(arena.get(SlotRef::new(0, 0)), None);
        assert_eq!(arena.remove(SlotRef::new(0, 0)), None);
        arena.check_invariants();
    }

    #[test]
    fn test_growth_policy() {
        let mut arena = SlotArena::new();
        arena.insert(0).unwrap();
        assert_eq!(arena.pages(), MIN_PAGES_INCREMENT);
        assert_eq!(arena.live_pages(), 1);

        for i in 1..PAGE_CAPACITY * MIN_PAGES_INCREMENT + 1 {
            arena.insert(i).unwrap();
        }
        // One page beyond the first increment doubles the page array.
        assert_eq!(arena.pages(), MIN_PAGES_INCREMENT * 2);
        assert_eq!(arena.live_pages(), MIN_PAGES_INCREMENT + 1);
        arena.check_invariants();
    }

    #[test]
    fn test_full_page_leaves_partial_list() {
        let mut arena = SlotArena::new();
        let refs = (0..PAGE_CAPACITY).map(|i| arena.insert(i).unwrap()).collect_vec();
        assert!(refs.iter().all(|r| r.page() == refs[0].page()));
        arena.check_invariants();

        // Next insertion lands on a fresh page.
        let next = arena.insert(PAGE_CAPACITY).unwrap();
        assert_ne!(next.page(), refs[0].page());

        // Freeing one slot puts the full page back on the partial list.
        arena.remove(refs[5]).unwrap();
        arena.check_invariants();
    }

    #[test]
    fn test_empty_page_released_under_low_load() {
        let mut arena = SlotArena::new();
        let refs = (0..PAGE_CAPACITY * 2).map(|i| arena.insert(i).unwrap()).collect_vec();
        assert_eq!(arena.live_pages(), 2);

        for r in &refs[PAGE_CAPACITY..] {
            arena.remove(*r).unwrap();
        }
        // Load is exactly 50% when the second page empties, it is kept.
        assert_eq!(arena.live_pages(), 2);

        arena.remove(refs[0]).unwrap();
        arena.remove(refs[1]).unwrap();
        arena.release_empty_pages();
        assert_eq!(arena.live_pages(), 1);
        arena.check_invariants();

        for r in &refs[2..PAGE_CAPACITY] {
            arena.remove(*r).unwrap();
        }
        assert_eq!(arena.live_pages(), 0);
        // Trailing pages without slots are truncated.
        assert_eq!(arena.pages(), 0);
        arena.check_invariants();
    }

    #[test]
    fn test_shrink_suppressed() {
        let mut arena = SlotArena::new();
        let refs = (0..10).map(|i| arena.insert(i).unwrap()).collect_vec();

        arena.set_shrink_suppressed(true);
        for r in refs {
            arena.remove(r).unwrap();
        }
        assert_eq!(arena.live_pages(), 1);

        arena.set_shrink_suppressed(false);
        arena.release_empty_pages();
        assert_eq!(arena.live_pages(), 0);
        arena.check_invariants();
    }

    #[test]
    fn test_iter_and_drain() {
        let mut arena = SlotArena::new();
        let refs = (0..300).map(|i| arena.insert(i).unwrap()).collect_vec();
        for r in refs.iter().step_by(2) {
            arena.remove(*r).unwrap();
        }

        let mut values = arena.iter().map(|(_, v)| *v).collect_vec();
        values.sort_unstable();
        assert_eq!(values, (0..300).filter(|i| i % 2 == 1).collect_vec());
        for (r, v) in arena.iter() {
            assert_eq!(arena.get(r), Some(v));
        }

        let mut drained = arena.drain();
        drained.sort_unstable();
        assert_eq!(drained.len(), 150);
        assert!(arena.is_empty());
        assert_eq!(arena.pages(), 0);
        arena.check_invariants();
    }

    #[test]
    fn test_get_mut() {
        let mut arena = SlotArena::new();
        let r = arena.insert(1).unwrap();
        *arena.get_mut(r).unwrap() += 41;
        assert_eq!(arena.get(r), Some(&42));
    }

    #[test]
    fn test_no_space_error_kind() {
        let err: Error = SlabError::Exhausted { pages: 42 }.into();
        assert_eq!(err.kind(), ErrorKind::NoSpace);
    }
}
