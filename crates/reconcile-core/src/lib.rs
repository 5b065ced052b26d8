//! # Reconcile Core
//!
//! Level-triggered reconcile engine for one Declaration kind and the objects
//! it owns.
//!
//! Data flows from the [`event_source::EventSource`] into the
//! [`queue::WorkQueue`], from which a fixed pool of workers in
//! [`controller::Controller`] runs the [`reconciler::Reconciler`]. A run reads
//! everything it needs from the [`store::ObjectStore`], renders desired state
//! through a [`render::DesiredStateRenderer`], writes it with the
//! [`apply::ApplyEngine`] and reports the aggregate state computed by
//! [`status::aggregate_status`]. Failed runs go back on the queue with
//! per-key exponential backoff.
//!
//! The engine does not implement a store. The hosting process supplies one;
//! the `test-util` feature provides an in-memory store and event recorder.

pub mod apply;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod document;
pub mod error;
pub mod event_source;
pub mod events;
pub mod object;
pub mod owner_index;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod render;
pub mod status;
pub mod store;

#[cfg(feature = "test-util")]
pub mod mock;

pub use apply::{ApplyConflict, ApplyEngine, ApplyMode, FieldConflict, FieldPath, FieldSet, ManagedFields};
pub use config::{ConfigError, ControllerConfig};
pub use controller::Controller;
pub use document::Document;
pub use error::{DocumentError, ErrorClass, ReconcileError, RegistryError, StoreError};
pub use event_source::EventSource;
pub use events::{EventRecorder, EventType, NoopRecorder};
pub use object::{LabelSelector, ReconcileKey, ResourceKey};
pub use owner_index::OwnerIndex;
pub use queue::WorkQueue;
pub use reconciler::{Action, Reconciler};
pub use registry::{TypeRegistry, TypeRegistryBuilder};
pub use render::DesiredStateRenderer;
pub use status::{ObservedKind, aggregate_status};
pub use store::{ObjectStore, WatchEvent, WatchEventType, WatchStream};

#[cfg(feature = "test-util")]
pub use mock::{MockObjectStore, MockRecorder, RecordedEvent, StoreOp};
