//! Consistency coordination for entities shared between services.
//!
//! Two independent tools live here:
//!
//! - [`ConsistencyCoordinator::handle_eventual_consistency`] performs a
//!   single-attempt optimistic read-modify-write on one entity's version
//!   marker, holding an advisory lock while the caller's update runs.
//! - [`ConsistencyCoordinator::validate_data_consistency`] asks remote
//!   services to confirm their view of a set of entities and reports every
//!   outcome at once.
//!
//! Neither retries on conflict; that decision belongs to the caller.

pub mod config;
pub mod coordinator;
pub mod entity;
pub mod error;
pub mod lock;
pub mod validation;
pub mod version;

pub use config::CoordinatorConfig;
pub use coordinator::ConsistencyCoordinator;
pub use entity::EntityRef;
pub use error::{BoxError, ConsistencyError, Result};
pub use lock::LockRecord;
pub use validation::{ConsistencyValidation, ValidationReport, ValidationResult};
pub use version::{Version, VersionMarker};
