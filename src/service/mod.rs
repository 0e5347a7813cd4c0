//! Observability REST service.
//!
//! Read access to crawl results and rankings, plus administrative resets.
//!
//! ## Endpoints
//!
//! - `GET /api/groups/:group/neighbors` - Neighbors of the last successful crawl
//! - `GET /api/groups/:group/crawl` - Last crawl result
//! - `GET /api/crawl/status` - Active crawl snapshot
//! - `GET /api/groups/:group/ranked?at=` - Ranked posts
//! - `POST /api/admin/ephemeral/delete` - Delete ephemeral rows by prefix
//! - `POST /api/admin/ephemeral/sweep` - Delete expired ephemeral rows
//! - `POST /api/admin/flush` - Flush index buffers
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_admin_delete};
pub use routes::{create_router, AppState};
pub use state::{ServiceState, DELETABLE_PREFIXES};
