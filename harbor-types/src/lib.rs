//! # harbor-types
//!
//! Protocol vocabulary shared by the FileHarbor server and client:
//!
//! - [`frame`]: the wire codec (fixed header + JSON payload + binary body)
//! - [`message`]: the tagged request/response enums, one variant per command
//! - [`status`]: status codes and the closed error-kind set
//! - [`ids`]: identity newtypes for libraries, clients, and sessions
//! - [`path`]: pure relative-path validation (traversal screening)

pub mod frame;
pub mod ids;
pub mod message;
pub mod path;
pub mod status;

pub use frame::{Frame, FrameError, FrameHeader, FrameKind, PROTOCOL_VERSION};
pub use ids::{ClientId, LibraryId, SessionId};
pub use message::{EntryInfo, EntryKind, Request, Response};
pub use status::{ErrorKind, StatusCode};
