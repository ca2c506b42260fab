pub mod common;
pub mod core;
pub mod service;
pub mod storage;

pub use common::{Config, DevMode, FaceIdError, Result};
pub use core::{match_probe, Embedding, EmbeddingProvider, FaceBox, FaceLocator, MatchOutcome, OnnxEmbeddingProvider};
pub use service::{router, AppState, EnrollmentSession, Reconciler};
pub use storage::{CancellationLedger, IdentityStore, Store};
