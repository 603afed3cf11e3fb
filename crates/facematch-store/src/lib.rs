//! facematch-store — probe result records, object storage and QR artifacts.

pub mod artifact;
pub mod object;
pub mod record;
pub mod staging;

pub use artifact::{match_payload, ArtifactError, QrGenerator, QrPublisher, SideArtifact};
pub use object::{LocalObjectStore, ObjectStore, ObjectStoreError};
pub use record::{ProbeResult, RecordStore, SqliteRecordStore, StoreError};
pub use staging::{stage_prefix, Layout, StageReport};
