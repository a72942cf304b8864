//! Slotframes and cells (§3 "Slotframe"/"Cell", §4.3 node-schedule decision).
//!
//! Cell option flags are a hand-rolled bitset rather than a `bitflags`
//! dependency: three stable bits with no need for the macro's derive
//! machinery.

use crate::packet::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellOptions(u8);

impl CellOptions {
    pub const NONE: CellOptions = CellOptions(0);
    pub const TX: CellOptions = CellOptions(0b001);
    pub const RX: CellOptions = CellOptions(0b010);
    pub const SHARED: CellOptions = CellOptions(0b100);

    pub fn contains(self, other: CellOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: CellOptions) -> Self {
        CellOptions(self.0 | other.0)
    }

    pub fn is_tx(self) -> bool {
        self.contains(Self::TX)
    }

    pub fn is_rx(self) -> bool {
        self.contains(Self::RX)
    }

    pub fn is_shared(self) -> bool {
        self.contains(Self::SHARED)
    }
}

impl std::ops::BitOr for CellOptions {
    type Output = CellOptions;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Distinguishes the EB-advertising cell (served from the EB virtual
/// neighbor's queue) from every ordinary data cell (§4.3 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Normal,
    Advertising,
}

/// A scheduler-defined hook run when a cell is selected as primary for the
/// current slot (§4.3 step 3: "run any action hook registered on the
/// cell"). Kept as a closed enum rather than a boxed closure: schedulers
/// built into this crate only ever need to refresh a cursor, and a closure
/// would need `&mut Network` to do anything richer, which `Node::schedule`
/// deliberately does not have access to (§9, avoiding cyclic mutable
/// references).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellAction {
    #[default]
    None,
    /// Advance a round-robin pointer the scheduler stores elsewhere,
    /// identified by this opaque token (interpreted by the scheduler plugin).
    AdvanceRoundRobin(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub timeslot: u16,
    pub channel_offset: u8,
    pub neighbor_id: Option<NodeId>,
    pub kind: CellKind,
    pub options: CellOptions,
    pub action: CellAction,
}

impl Cell {
    pub fn new(timeslot: u16, channel_offset: u8, neighbor_id: Option<NodeId>, options: CellOptions) -> Self {
        Self {
            timeslot,
            channel_offset,
            neighbor_id,
            kind: CellKind::Normal,
            options,
            action: CellAction::None,
        }
    }

    pub fn advertising(timeslot: u16, channel_offset: u8, options: CellOptions) -> Self {
        Self {
            timeslot,
            channel_offset,
            neighbor_id: None,
            kind: CellKind::Advertising,
            options,
            action: CellAction::None,
        }
    }

    pub fn time_to_timeslot(&self, asn: u64, slotframe_size: u16) -> u16 {
        let current = (asn % slotframe_size as u64) as u16;
        (self.timeslot + slotframe_size - current) % slotframe_size
    }
}

/// A cyclic schedule of `size` slots holding a sparse set of cells (§3).
pub struct Slotframe {
    pub handle: u32,
    pub size: u16,
    cells: Vec<Cell>,
}

impl Slotframe {
    pub fn new(handle: u32, size: u16) -> Self {
        assert!(size >= 1, "slotframe size must be >= 1");
        Self {
            handle,
            size,
            cells: Vec::new(),
        }
    }

    /// Insert a cell, rejecting a (timeslot, channel_offset) collision
    /// unless `allow_overlap` is set (the invariant's "unless the scheduler
    /// explicitly permits" escape hatch).
    pub fn add_cell(&mut self, cell: Cell, allow_overlap: bool) -> Result<(), String> {
        if cell.timeslot >= self.size {
            return Err(format!(
                "cell timeslot {} out of range for slotframe size {}",
                cell.timeslot, self.size
            ));
        }
        if !allow_overlap
            && self
                .cells
                .iter()
                .any(|c| c.timeslot == cell.timeslot && c.channel_offset == cell.channel_offset)
        {
            return Err(format!(
                "cell already exists at (timeslot={}, channel_offset={}) in slotframe {}",
                cell.timeslot, cell.channel_offset, self.handle
            ));
        }
        self.cells.push(cell);
        Ok(())
    }

    pub fn remove_cell(&mut self, timeslot: u16, channel_offset: u8) -> Option<Cell> {
        let idx = self.cells.iter().position(|c| c.timeslot == timeslot && c.channel_offset == channel_offset)?;
        Some(self.cells.remove(idx))
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }
}

/// Tie-break between two simultaneously-matching cells of the same option
/// class (§4.3 step 3). Prefers a dedicated cell over a shared one, then
/// the lower channel offset, then a dedicated neighbor target over a
/// broadcast/shared one — in that order, deterministically.
pub fn select_best_tsch_cell(best: &Cell, candidate: &Cell) -> bool {
    if best.options.is_shared() != candidate.options.is_shared() {
        return !candidate.options.is_shared() && best.options.is_shared();
    }
    if best.channel_offset != candidate.channel_offset {
        return candidate.channel_offset < best.channel_offset;
    }
    candidate.neighbor_id.is_some() && best.neighbor_id.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_cell_rejects_duplicate_coordinates() {
        let mut sf = Slotframe::new(0, 10);
        sf.add_cell(Cell::new(3, 0, Some(2), CellOptions::TX), false).unwrap();
        let err = sf.add_cell(Cell::new(3, 0, Some(5), CellOptions::RX), false);
        assert!(err.is_err());
    }

    #[test]
    fn add_cell_allows_overlap_when_explicitly_permitted() {
        let mut sf = Slotframe::new(0, 10);
        sf.add_cell(Cell::new(3, 0, Some(2), CellOptions::TX), false).unwrap();
        sf.add_cell(Cell::new(3, 0, Some(5), CellOptions::RX), true).unwrap();
        assert_eq!(sf.cells().len(), 2);
    }

    #[test]
    fn add_cell_rejects_timeslot_out_of_range() {
        let mut sf = Slotframe::new(0, 5);
        let err = sf.add_cell(Cell::new(5, 0, None, CellOptions::RX), false);
        assert!(err.is_err());
    }

    #[test]
    fn time_to_timeslot_wraps_around_slotframe() {
        let cell = Cell::new(2, 0, None, CellOptions::RX);
        assert_eq!(cell.time_to_timeslot(2, 10), 0);
        assert_eq!(cell.time_to_timeslot(9, 10), 3);
        assert_eq!(cell.time_to_timeslot(0, 10), 2);
    }

    #[test]
    fn cell_options_union_and_contains() {
        let opts = CellOptions::TX | CellOptions::SHARED;
        assert!(opts.is_tx());
        assert!(opts.is_shared());
        assert!(!opts.is_rx());
    }

    #[test]
    fn select_best_tsch_cell_prefers_dedicated_over_shared() {
        let dedicated = Cell::new(1, 0, Some(9), CellOptions::TX);
        let shared = Cell::new(1, 0, None, CellOptions::TX | CellOptions::SHARED);
        assert!(select_best_tsch_cell(&shared, &dedicated));
        assert!(!select_best_tsch_cell(&dedicated, &shared));
    }

    #[test]
    fn select_best_tsch_cell_prefers_lower_channel_offset() {
        let a = Cell::new(1, 5, Some(9), CellOptions::TX);
        let b = Cell::new(1, 2, Some(9), CellOptions::TX);
        assert!(select_best_tsch_cell(&a, &b));
        assert!(!select_best_tsch_cell(&b, &a));
    }
}
