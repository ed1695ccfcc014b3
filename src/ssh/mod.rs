pub mod channel;
pub mod executor;
pub mod factory;
pub mod fs;
pub mod resolver;
pub mod session;
pub mod target;

pub use executor::{ChannelExecutor, CommandExecutor, ExecutionIo, ExecutionRequest, ExecutionResult};
pub use factory::{PooledSessionFactory, SessionFactory, Ssh2SessionFactory};
pub use resolver::{RemotePathResolver, ResolvedPath};
pub use session::TransportSession;
pub use target::RemoteTarget;
