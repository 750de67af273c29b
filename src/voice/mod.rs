//! Mesh-Voice-Channel: ein direkter Transport pro Mitgliedspaar

pub mod mesh;

pub use mesh::{MeshError, MeshEvent, PeerRecord, VoiceMesh};
