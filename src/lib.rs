//! Deterministic generation of source artifacts from an RDF specification.
//!
//! Each configured target runs a five-stage pipeline
//! (Normalize -> Extract -> Emit -> Canonicalize -> Receipt), producing
//! byte-identical output for identical inputs. A dependency snapshot lets
//! [`SyncEngine`] rebuild only the targets whose inputs changed, and every
//! artifact carries a receipt that [`Verifier`] checks for drift.

pub mod codegen;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod ontology;
pub mod shutdown;
pub mod sparql;
pub mod sync;
pub mod template;
pub mod verify;

pub use config::{CONFIG_FILE_NAME, GgenConfig, TargetConfig, Workspace};
pub use error::{ErrorClass, PipelineError, PipelineResult};
pub use logging::{LoggingConfig, init_logging};
pub use shutdown::RunCancellation;
pub use sync::{ReportFormat, SyncEngine, SyncOptions};
pub use sync::report::{SyncReport, TargetStatus, VerifyReport};
pub use verify::{VerificationResult, Verifier, VerifyMode, VerifyOptions};
