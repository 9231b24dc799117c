pub mod api;
pub mod blockmap;
pub mod bmap;
pub mod error;
pub mod incore;
pub mod io;
pub mod report;
pub mod scan;
pub mod xfs;

pub use api::{ScanOptions, ScanReport, scan};
pub use blockmap::{BlockMap, BlockState};
pub use error::FxfsckError;
pub use incore::Inventory;
pub use io::device::{BlockDev, DeviceIo, MemDev};
pub use report::Reporter;
