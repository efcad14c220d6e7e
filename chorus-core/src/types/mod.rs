pub mod ids;

pub use ids::{AlbumId, ArtistId, CommandId, IndexerId};
