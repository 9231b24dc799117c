use thiserror::Error;

#[derive(Error, Debug)]
pub enum FxfsckError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bad magic number in {0}")]
    BadMagic(&'static str),
    #[error("Parse error: {0}")]
    Parse(&'static str),
    /// The superblock/AGF/AGI triple of an AG could not be read. The AG's
    /// scan task is abandoned; the scan as a whole continues.
    #[error("can't read AG header for ag {agno}")]
    AgHeader { agno: u32 },
}
