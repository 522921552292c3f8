//! Per-portion state shared by both layer kinds.
//!
//! A [`PortionStore`] keeps flags, colors, pick colors and offsets as parallel arrays
//! indexed by portion offset. Every write marks a coalesced dirty range per channel
//! that the owning layer turns into one sub-range buffer update at flush time.

use std::ops::Range;

use crate::data_structures::flags::{LayerCounters, PortionFlags};

/// Strongly typed handle of one portion inside a scene model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortionId {
    pub layer_index: u32,
    pub offset: u32,
}

/// Smallest range covering every portion written since the last flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyRange(Option<(u32, u32)>);

impl DirtyRange {
    pub fn mark(&mut self, offset: u32) {
        self.0 = Some(match self.0 {
            Some((start, end)) => (start.min(offset), end.max(offset + 1)),
            None => (offset, offset + 1),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.0.is_none()
    }

    pub fn take(&mut self) -> Option<Range<usize>> {
        self.0.take().map(|(start, end)| start as usize..end as usize)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyChannels {
    pub flags: DirtyRange,
    pub colors: DirtyRange,
    pub offsets: DirtyRange,
}

impl DirtyChannels {
    pub fn is_clean(&self) -> bool {
        self.flags.is_clean() && self.colors.is_clean() && self.offsets.is_clean()
    }
}

#[derive(Debug, Default)]
pub struct PortionStore {
    flags: Vec<PortionFlags>,
    colors: Vec<[u8; 4]>,
    pick_colors: Vec<[u8; 4]>,
    offsets: Vec<[f32; 3]>,
    counters: LayerCounters,
    dirty: DirtyChannels,
}

impl PortionStore {
    /// Appends a portion and returns its offset. A color with alpha below 255 marks
    /// the portion transparent.
    pub fn push(&mut self, flags: PortionFlags, color: [u8; 4], pick_color: [u8; 4]) -> u32 {
        let mut flags = flags;
        flags.set(PortionFlags::TRANSPARENT, color[3] < 255);
        let offset = self.flags.len() as u32;
        self.flags.push(flags);
        self.colors.push(color);
        self.pick_colors.push(pick_color);
        self.offsets.push([0.0; 3]);
        self.counters.add_portion(flags);
        offset
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn counters(&self) -> &LayerCounters {
        &self.counters
    }

    pub fn flags(&self, offset: u32) -> Option<PortionFlags> {
        self.flags.get(offset as usize).copied()
    }

    /// The only write path for portion flags. Returns the previous flags.
    pub fn set_flags(&mut self, offset: u32, new: PortionFlags) -> Option<PortionFlags> {
        let slot = self.flags.get_mut(offset as usize)?;
        let old = *slot;
        if old != new {
            *slot = new;
            self.counters.apply(old, new);
            self.dirty.flags.mark(offset);
        }
        Some(old)
    }

    pub fn set_flag(&mut self, offset: u32, flag: PortionFlags, on: bool) -> Option<PortionFlags> {
        let mut new = self.flags(offset)?;
        new.set(flag, on);
        self.set_flags(offset, new)
    }

    pub fn color(&self, offset: u32) -> Option<[u8; 4]> {
        self.colors.get(offset as usize).copied()
    }

    /// Writes RGBA and keeps `TRANSPARENT` in step with the alpha channel.
    pub fn set_color(&mut self, offset: u32, color: [u8; 4]) {
        let Some(slot) = self.colors.get_mut(offset as usize) else {
            return;
        };
        if *slot != color {
            *slot = color;
            self.dirty.colors.mark(offset);
        }
        self.set_flag(offset, PortionFlags::TRANSPARENT, color[3] < 255);
    }

    pub fn pick_color(&self, offset: u32) -> Option<[u8; 4]> {
        self.pick_colors.get(offset as usize).copied()
    }

    pub fn offset(&self, offset: u32) -> Option<[f32; 3]> {
        self.offsets.get(offset as usize).copied()
    }

    pub fn set_offset(&mut self, offset: u32, value: [f32; 3]) {
        if let Some(slot) = self.offsets.get_mut(offset as usize) {
            if *slot != value {
                *slot = value;
                self.dirty.offsets.mark(offset);
            }
        }
    }

    pub fn all_flags(&self) -> &[PortionFlags] {
        &self.flags
    }

    pub fn all_colors(&self) -> &[[u8; 4]] {
        &self.colors
    }

    pub fn all_pick_colors(&self) -> &[[u8; 4]] {
        &self.pick_colors
    }

    pub fn all_offsets(&self) -> &[[f32; 3]] {
        &self.offsets
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_clean()
    }

    /// Hands the pending dirty ranges to the caller and resets them.
    pub fn take_dirty(&mut self) -> DirtyChannels {
        std::mem::take(&mut self.dirty)
    }

    /// Drops pending ranges, used after a full upload made them redundant.
    pub fn clear_dirty(&mut self) {
        self.dirty = DirtyChannels::default();
    }
}
