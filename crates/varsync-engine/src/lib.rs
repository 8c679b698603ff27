pub mod backend;
pub mod error;
pub mod executor;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod store;
pub mod tracker;
pub mod variable;
pub mod watch;
pub mod wrapper;

pub use backend::Backend;
pub use error::EngineError;
pub use executor::{ExecutorHandle, SessionExecutor, TimerHandle};
pub use registry::ObjectRegistry;
pub use session::{Dispatcher, Origin, Outbound, Role, SessionState, Target};
pub use store::VariableStore;
pub use tracker::{ChangeTracker, RefreshSchedule, VariableUpdate};
pub use variable::Variable;
pub use watch::{UnwatchTransition, WatchTable, WatchTransition};
pub use wrapper::{Wrapper, WrapperContext, WrapperFactory, WrapperRegistry};
