//! Compilador de grafos de streams particionados y runtime de pods/bushes,
//! más los tipos compartidos entre master, worker y client.

pub mod builder;
pub mod bush;
pub mod call;
pub mod capability;
pub mod config;
pub mod directory;
pub mod error;
pub mod fuser;
pub mod graph;
pub mod job;
pub mod partitioner;
pub mod planner;
pub mod pod;
pub mod proxy;
pub mod runtime;
pub mod task;
pub mod transforms;
pub mod worker;

pub use builder::{compile, ProxyDescriptor, ProxyKind, UnitDescriptor};
pub use bush::{Bush, UnitState};
pub use call::{CallRequest, CallResponse, Fault, Value};
pub use config::RuntimeConfig;
pub use directory::Directory;
pub use error::{CallError, DirectoryError, GraphError, PodError};
pub use graph::{Graph, LinkRef, NodeRef, UnitKey};
pub use job::{JobId, JobInfo, JobRequest, JobStatus, UnitOutput};
pub use proxy::{LocalCaller, UnitCaller};
pub use task::{Deployment, DeploymentId};
pub use transforms::TransformRegistry;
pub use worker::{
    DeploymentCompleteRequest, DeploymentCompleteResponse, DeploymentRequest,
    DeploymentResponse, UnitCallRequest, UnitLocation, UnitRegisterRequest, UnitRegisterResponse, UnitReport,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
