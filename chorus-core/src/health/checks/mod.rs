//! Built-in health checks.

pub mod root_folder;

pub use root_folder::{
    ArtistPathSource, DiskProbe, LocalDiskProbe, ROOT_FOLDER_CHECK,
    RootFolderCheck,
};
