use astronomy_service::pipeline::Presenter;
use bytes::Bytes;

use crate::catalog::Catalog;

/// The image format of a payload, sniffed from its first bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
    Unknown,
}

impl ImageKind {
    pub fn sniff(payload: &[u8]) -> Self {
        if payload.starts_with(b"\x89PNG\r\n\x1a\n") {
            Self::Png
        } else if payload.starts_with(&[0xff, 0xd8, 0xff]) {
            Self::Jpeg
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Unknown => "unknown",
        }
    }
}

/// What a cell currently displays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shown {
    pub kind: ImageKind,
    pub size: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Cell {
    pub photo: Option<u64>,
    pub shown: Option<Shown>,
}

/// A fixed number of reusable cells showing a window of the catalog.
#[derive(Clone, Debug)]
pub struct TerminalGrid {
    cells: Vec<Cell>,
}

impl TerminalGrid {
    pub fn new(slots: usize) -> Self {
        Self {
            cells: vec![Cell::default(); slots],
        }
    }

    pub fn slots(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = (usize, &Cell)> {
        self.cells.iter().enumerate()
    }

    /// Assigns `photo` to `slot`, dropping whatever the cell showed before.
    pub fn assign(&mut self, slot: usize, photo: Option<u64>) {
        if let Some(cell) = self.cells.get_mut(slot) {
            if cell.photo != photo {
                cell.photo = photo;
                cell.shown = None;
            }
        }
    }

    /// Lets the cells show the catalog starting at `offset`.
    ///
    /// Cells past the end of the catalog are left unassigned.
    pub fn scroll_to(&mut self, catalog: &Catalog, offset: usize) {
        for slot in 0..self.slots() {
            let photo = catalog.photos.get(offset + slot).map(|photo| photo.id);
            self.assign(slot, photo);
        }
    }
}

impl Presenter for TerminalGrid {
    type Key = u64;
    type Slot = usize;

    fn current_key(&self, slot: usize) -> Option<u64> {
        self.cells.get(slot)?.photo
    }

    fn apply(&mut self, slot: usize, payload: &Bytes) {
        if let Some(cell) = self.cells.get_mut(slot) {
            cell.shown = Some(Shown {
                kind: ImageKind::sniff(payload),
                size: payload.len(),
            });
        }
    }
}
