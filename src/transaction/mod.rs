pub mod coordinator;
pub mod tx;

pub use coordinator::TransactionCoordinator;
pub use tx::{Transaction, TransactionState};
