mod escape;
mod storage;

pub use escape::{EscapeError, escape_path, unescape_path, unescape_version};
pub use storage::{FileHandle, FilesystemStorage, TempFile};
