use crate::segment::Generation;

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("out of memory: {requested} bytes do not fit in {generation:?}")]
    OutOfMemory {
        generation: Generation,
        requested: usize,
    },

    #[error("invalid reference {0:#x}: no segment or no registered type")]
    InvalidReference(usize),

    #[error("forbidden managed->region reference {parent:#x} -> {child:#x}")]
    BadReferenceEdge { parent: usize, child: usize },

    #[error("bad argument: {0}")]
    BadArgument(String),
}

pub type Result<T> = std::result::Result<T, GcError>;

impl GcError {
    pub(crate) fn bad_argument(msg: impl Into<String>) -> Self {
        GcError::BadArgument(msg.into())
    }
}
