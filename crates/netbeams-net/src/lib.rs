//! BeamMP-compatible network core: wire framing, player slots, authentication,
//! the per-connection handshake, TCP/UDP listeners and service supervision.

pub mod auth;
pub mod connection;
pub mod framing;
pub mod player;
pub mod service;
pub mod settings;
pub mod slots;
pub mod tcp_server;
pub mod udp_server;

pub use auth::{ApiPlayer, AuthError, AuthGateway, BeamMpApi};
pub use connection::{Connection, ConnectionError, ConnectionState, ServerContext};
pub use framing::{Frame, FrameError, FrameReader, MAX_HEADER_SIZE, encode, write_frame};
pub use player::{Account, Player};
pub use service::{Service, ServiceError, ServiceStatus, StatusWatch, Supervisor};
pub use settings::{ProtocolSettings, SettingsError, VersionCheck, VersionRange};
pub use slots::{Expiry, Lease, SlotError, SlotId, SlotManager};
pub use tcp_server::{ConnectionHandle, ConnectionMap, TcpServer};
pub use udp_server::UdpServer;
