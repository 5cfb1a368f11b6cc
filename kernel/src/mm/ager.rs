//! Timer-driven page ager
//!
//! On every timer tick the kernel sweeps a budgeted window of the frame
//! table, starting at a persistent cursor. A frame whose reverse-map chain
//! shows a hardware accessed bit gets its ages bumped and the bit cleared
//! in every PTE mapping it; an untouched frame decays. The budget grows as
//! free memory shrinks, so the ages the victim chooser reads are freshest
//! exactly when eviction is imminent.

use super::frame::FrameNumber;
use super::{
    PteFlags, MAX_PAGE_AGE, NPAGESFREE_HIGH_THRESHOLD, NPAGESFREE_LOW_THRESHOLD,
    NPAGEUPDATES_FACTOR, PAGE_AGE_DECREMENT_ON_CLOCK, PAGE_AGE_INCREMENT_ON_ACCESS,
};
use crate::machine::Kernel;

/// Persistent sweep state
#[derive(Debug, Default)]
pub struct AgerState {
    /// Frame the next sweep starts at
    pub cursor: usize,
    /// Monotonic access sequence, stamped into frames on observed access
    pub counter: u32,
}

impl Kernel {
    /// One aging sweep. Runs with the big kernel lock held (the caller is
    /// the timer interrupt path).
    pub fn update_page_ages(&mut self) {
        let npages = self.frames.npages();
        if npages == 0 {
            return;
        }
        let start = self.ager.cursor % npages;
        let mut cur = start;

        let mut budget = (NPAGEUPDATES_FACTOR * NPAGESFREE_LOW_THRESHOLD) as isize;
        let free = self.frames.num_free();
        if free <= NPAGESFREE_LOW_THRESHOLD {
            budget += (NPAGEUPDATES_FACTOR * NPAGESFREE_HIGH_THRESHOLD) as isize;
        }
        if free <= NPAGESFREE_HIGH_THRESHOLD {
            budget += (NPAGEUPDATES_FACTOR * NPAGESFREE_LOW_THRESHOLD) as isize;
        }

        loop {
            // skip frames nothing references
            while self.frames.get(FrameNumber::new(cur as u32)).refcount == 0 {
                cur = (cur + 1) % npages;
                if cur == start {
                    self.ager.cursor = cur;
                    return;
                }
            }

            let frame = FrameNumber::new(cur as u32);
            let head = self.frames.get(frame).rmap_head;
            let accessed = self
                .rmap
                .find_pte(head, &self.phys, PteFlags::ACCESSED)
                .is_some();
            if accessed {
                self.rmap.clear_flags(head, &mut self.phys, PteFlags::ACCESSED);
                let stamp = self.ager.counter;
                self.ager.counter = self.ager.counter.wrapping_add(1);
                let info = self.frames.get_mut(frame);
                info.age = info.age.saturating_add(PAGE_AGE_INCREMENT_ON_ACCESS).min(MAX_PAGE_AGE);
                info.nfu_age = info
                    .nfu_age
                    .saturating_add(PAGE_AGE_INCREMENT_ON_ACCESS)
                    .min(MAX_PAGE_AGE);
                info.timestamp = stamp;
            } else {
                let info = self.frames.get_mut(frame);
                info.age = info.age.saturating_sub(PAGE_AGE_DECREMENT_ON_CLOCK);
            }

            cur = (cur + 1) % npages;
            if cur == start {
                break;
            }
            budget -= 1;
            if budget < 0 {
                break;
            }
        }
        self.ager.cursor = cur;
    }
}
