// Workflow controllers built on the state machine runtime

pub mod disposition;
pub mod identity;
pub mod payment;

pub use disposition::{
    AssetDispositionController, AssetItem, ConsignmentEligibility, DeliveryEligibility, DispositionError,
    DispositionState, ItemFlags, SubmitOutcome,
};
pub use identity::{IdentityError, IdentityState, IdentityStatus, IdentityVerificationController};
pub use payment::{PaymentError, PaymentHandoffController, PaymentStep};
