mod record;
mod samples;
mod state;
mod store;

pub use record::{Identity, IdentityBoxes, IdentityRecord, IdentitySnapshot, MergeConflict};
pub use samples::{Sample, SampleBuffer};
pub use state::IdentityState;
pub use store::{IdentityStore, MergeOutcome};
