use prettytable::{Row, Table, cell, format::consts::FORMAT_CLEAN, row};

use crate::browse::Outcome;
use crate::catalog::Catalog;

pub fn print_outcome(catalog: &Catalog, outcome: &Outcome) {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Slot", "Photo", "Rover", "Camera", "Sol", "Earth Date", "Image", "Bytes"]);

    for (slot, cell) in outcome.grid.cells() {
        let mut row = Row::empty();
        row.add_cell(cell!(r->slot));

        let Some(id) = cell.photo else {
            row.add_cell(cell!("-").with_hspan(7));
            table.add_row(row);
            continue;
        };
        row.add_cell(cell!(r->id));

        match catalog.get(id) {
            Some(photo) => {
                let rover = photo.rover.as_ref().map_or("", |rover| rover.name.as_str());
                row.add_cell(cell!(rover));
                let camera = photo.camera.full_name.as_deref().unwrap_or(&photo.camera.name);
                row.add_cell(cell!(camera));
                row.add_cell(cell!(r->photo.sol));
                row.add_cell(cell!(photo.earth_date));
            }
            None => row.add_cell(cell!("").with_hspan(4)),
        }

        match cell.shown {
            Some(shown) => {
                row.add_cell(cell!(shown.kind.as_str()));
                row.add_cell(cell!(r->shown.size));
            }
            None => row.add_cell(cell!("missing").with_hspan(2)),
        }

        table.add_row(row);
    }

    table.printstd();

    println!();
    println!("Deliveries: {}", outcome.report);
    let loads: Vec<_> = outcome
        .loads
        .iter()
        .map(|(status, count)| format!("{count} {status}"))
        .collect();
    println!("Loads:      {}", loads.join(", "));
    println!("Cached:     {} photos", outcome.cached);
}
