//! HTTP mirror of a model hub: routes requests to local model directories or to the block
//! cache, which fills itself from the upstream on demand.

use http::StatusCode;
use hubmirror_core::MirrorErrorKind;

pub mod api_cache;
pub mod config;
pub mod context;
pub mod model_bin;
pub mod routes;
pub mod server;
pub mod sources;

pub use config::{MirrorConfig, ModelBinConfig};
pub use context::AppContext;
pub use server::{serve, serve_listener};

/// HTTP status reported for a failed request of the given kind.
pub fn status_for(kind: MirrorErrorKind) -> StatusCode {
    match kind {
        MirrorErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        MirrorErrorKind::OutOfRange => StatusCode::RANGE_NOT_SATISFIABLE,
        MirrorErrorKind::NotFound => StatusCode::NOT_FOUND,
        MirrorErrorKind::Unavailable => StatusCode::GATEWAY_TIMEOUT,
        MirrorErrorKind::Incomplete => StatusCode::SERVICE_UNAVAILABLE,
        MirrorErrorKind::Corrupt | MirrorErrorKind::Io | MirrorErrorKind::Unsupported => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
