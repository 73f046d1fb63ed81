//! Live stream forwarder server
//!
//! Routes player requests for platform rooms to the forwarders in
//! `lsf-proxy` and the tunnels in `lsf-tunnel`.

pub mod error;
pub mod extractor;
pub mod http;
pub mod server;

pub use error::{AppError, AppResult};
pub use extractor::{Extractor, PlaylistMode, Registry, Resolved};
pub use http::{create_router, AppState};
