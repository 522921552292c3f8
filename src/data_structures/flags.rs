//! Per-portion render state bits and the layer counters derived from them.
//!
//! The counters are what lets a layer skip a whole draw pass without looking at
//! its portions. [`LayerCounters::apply`] is the only function that touches them,
//! so every setter keeps `counter == number of portions with the bit set`.

bitflags::bitflags! {
    /// Render state of one portion. Uploaded verbatim as a `u32` vertex or
    /// instance attribute, shaders test the same bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct PortionFlags: u32 {
        const VISIBLE = 1 << 0;
        const XRAYED = 1 << 1;
        const HIGHLIGHTED = 1 << 2;
        const SELECTED = 1 << 3;
        const EDGES = 1 << 4;
        const CULLED = 1 << 5;
        const CLIPPABLE = 1 << 6;
        const COLLIDABLE = 1 << 7;
        const PICKABLE = 1 << 8;
        const TRANSPARENT = 1 << 9;
    }
}

impl PortionFlags {
    /// State of a freshly created, not yet entity-bound portion.
    pub const INITIAL: Self = Self::VISIBLE
        .union(Self::CLIPPABLE)
        .union(Self::COLLIDABLE)
        .union(Self::PICKABLE);
}

/// Running counts of portions per flag inside one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayerCounters {
    pub portions: u32,
    pub visible: u32,
    pub xrayed: u32,
    pub highlighted: u32,
    pub selected: u32,
    pub edges: u32,
    pub culled: u32,
    pub clippable: u32,
    pub collidable: u32,
    pub pickable: u32,
    pub transparent: u32,
}

impl LayerCounters {
    /// Registers a new portion carrying `flags`.
    pub fn add_portion(&mut self, flags: PortionFlags) {
        self.portions += 1;
        self.apply(PortionFlags::empty(), flags);
    }

    /// Accounts for one portion changing from `old` to `new`.
    pub fn apply(&mut self, old: PortionFlags, new: PortionFlags) {
        let set = new - old;
        let cleared = old - new;
        for flag in set.iter() {
            *self.counter_mut(flag) += 1;
        }
        for flag in cleared.iter() {
            let counter = self.counter_mut(flag);
            *counter = counter.saturating_sub(1);
        }
    }

    /// Count of portions with `flag` set. `flag` must be a single bit.
    pub fn count(&self, flag: PortionFlags) -> u32 {
        match flag.bits().trailing_zeros() {
            0 => self.visible,
            1 => self.xrayed,
            2 => self.highlighted,
            3 => self.selected,
            4 => self.edges,
            5 => self.culled,
            6 => self.clippable,
            7 => self.collidable,
            8 => self.pickable,
            9 => self.transparent,
            _ => 0,
        }
    }

    fn counter_mut(&mut self, flag: PortionFlags) -> &mut u32 {
        // bit positions follow the declaration order of `PortionFlags`
        match flag.bits().trailing_zeros() {
            0 => &mut self.visible,
            1 => &mut self.xrayed,
            2 => &mut self.highlighted,
            3 => &mut self.selected,
            4 => &mut self.edges,
            5 => &mut self.culled,
            6 => &mut self.clippable,
            7 => &mut self.collidable,
            8 => &mut self.pickable,
            _ => &mut self.transparent,
        }
    }

    /// Adds the counts of another layer, for model-wide totals.
    pub fn merge(&mut self, other: &LayerCounters) {
        self.portions += other.portions;
        self.visible += other.visible;
        self.xrayed += other.xrayed;
        self.highlighted += other.highlighted;
        self.selected += other.selected;
        self.edges += other.edges;
        self.culled += other.culled;
        self.clippable += other.clippable;
        self.collidable += other.collidable;
        self.pickable += other.pickable;
        self.transparent += other.transparent;
    }

    pub fn all_culled(&self) -> bool {
        self.culled == self.portions
    }

    pub fn all_transparent(&self) -> bool {
        self.transparent == self.portions
    }

    pub fn all_xrayed(&self) -> bool {
        self.xrayed == self.portions
    }
}
