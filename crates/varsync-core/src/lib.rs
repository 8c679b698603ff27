//! Shared types for the variable synchronization protocol: ids, priorities,
//! wire messages, the backend object model and path syntax.

pub mod errors;
pub mod ids;
pub mod message;
pub mod path;
pub mod priority;
pub mod value;

pub use errors::ProtocolError;
pub use ids::{ConnectionId, IdRange, ObjId, SessionId, VarId};
pub use message::{Message, Outgoing, Response};
pub use path::{Path, Segment};
pub use priority::Priority;
pub use value::{ObjectRef, Value, WeakObjectRef};
