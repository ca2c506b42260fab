pub mod enrollment;
pub mod http;
pub mod protocol;
pub mod sweep;
pub mod ws;

pub use enrollment::{EnrollmentContext, EnrollmentSession, Phase};
pub use http::{router, ApiKeyGuard, AppState};
pub use sweep::{Reconciler, SweepReport};
