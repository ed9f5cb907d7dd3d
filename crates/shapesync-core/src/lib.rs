//! ShapeSync core library
//!
//! A replicated, ordered collection of 2D shape records with a local editing
//! engine, snapshot undo/redo, presence, and a relay transport.

pub mod canvas;
pub mod collaboration;
pub mod crdt;
pub mod error;
pub mod history;
pub mod presence;
pub mod session;
pub mod shapes;
pub mod storage;
pub mod sync;
pub mod view;

pub use canvas::{Alignment, Axis, Canvas, PASTE_OFFSET};
pub use collaboration::Replicator;
pub use crdt::{ChangeOrigin, ObserverId, ShapeStore, StoreEvent};
pub use error::{Result, ShapeSyncError};
pub use history::History;
pub use presence::{PresenceTracker, RemotePeer};
pub use session::{Session, SessionConfig};
pub use shapes::{SerializableColor, ShapeId, ShapeKind, ShapePatch, ShapeRecord, ShapeStyle};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError};
pub use sync::{
    ClientMessage, ConnectionState, NativeWebSocket, ReconnectPolicy, ServerMessage, SyncEvent, Transport,
    TransportEvent,
};
pub use view::ViewState;
