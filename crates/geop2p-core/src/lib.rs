pub mod api;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod geo;
pub mod ids;
pub mod peer;
pub mod remote;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod spatial_db;
pub mod wire;

pub use api::{ClientMethods, LocalServiceMethods, Node, NodeMethods};
pub use clock::{Clock, SystemClock, TestClock};
pub use config::NodeConfig;
pub use dispatch::{serve_session, DispatchScope, Dispatcher};
pub use error::OverlayError;
pub use events::{ChangeListener, ListenerRegistry};
pub use geo::{distance_km, GpsLocation, EARTH_RADIUS_KM};
pub use ids::{NodeId, SessionId};
pub use peer::{
    NeighbourFilter, NetworkEndpoint, NodeContact, NodeDbEntry, NodeInfo, NodeProfile,
    NodeRelation, NodeRole, ServiceInfo,
};
pub use remote::{NodeHandle, NodeProxyFactory, RemoteNode, TcpProxyFactory};
pub use scheduler::MaintenanceScheduler;
pub use server::OverlayServer;
pub use session::{Session, MAX_MESSAGE_BYTES, NORMAL_STREAM_EXPIRATION};
pub use spatial_db::{InMemorySpatialDb, SpatialDatabase, SqliteSpatialDb};
pub use wire::{
    ClientRequest, LocalServiceRequest, Message, MessageBody, NeighbourhoodChange, NodeRequest,
    Request, RequestPayload, Response, ResponsePayload, Status,
};
