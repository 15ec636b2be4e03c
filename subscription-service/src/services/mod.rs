pub mod catalog;
pub mod events;
pub mod metrics;
pub mod reconciliation;
pub mod store;
pub mod stripe;

pub use catalog::PlanCatalog;
pub use reconciliation::{CheckoutOutcome, CheckoutTrigger, ReconcileOutcome, Reconciler};
pub use store::{InMemoryProfileStore, MongoProfileStore, ProfileStore, ProfileUpdate};
pub use stripe::StripeClient;
