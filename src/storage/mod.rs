//! Storage module
//!
//! Piece selection and verification, on-disk file layout, and the resume record.

pub mod file;
pub mod piece;
pub mod resume;

pub use file::{FileEntry, FileManager};
pub use piece::{BlockOutcome, BlockSpec, CompletedPiece, PieceManager, BLOCK_SIZE};
pub use resume::{ResumeStore, RESUME_FILE_NAME};
