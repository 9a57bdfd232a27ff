pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::{MemoryStore, OpKind, StoreOp};
pub use traits::{
    ChildEvent, ChildListener, ConnectivityListener, SignalingStore, Subscription,
    SubscriptionSet, ValueListener, is_server_timestamp, server_timestamp,
};
