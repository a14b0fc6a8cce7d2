mod server;
mod shutdown;

pub use server::run_client_server;
pub use server::run_node_server;
pub use server::AppServer;
pub use server::ControlServer;
pub use server::NodeServer;
pub use shutdown::shutdown_signal;
pub use shutdown::RpcServerShutdownHandle;
pub use shutdown::RpcServerShutdownSignal;
